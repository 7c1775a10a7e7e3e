//! Core-regularized Biot-Savart kernels for straight vortex filaments.
//!
//! The regularization adds `sigma^2 * |r0|^2` to the usual `|r1 x r2|^2`
//! denominator, which caps the induced speed near a filament at roughly
//! `gamma / (4 pi sigma)`.

use nalgebra::Vector3;
use std::f64::consts::PI;

const FOUR_PI: f64 = 4.0 * PI;

/// Distances below this are treated as coincident points.
pub const COINCIDENT_TOLERANCE: f64 = 1.0e-12;

/// Diffusive growth of a vortex core with wake age.
pub const CORE_GROWTH_RATE: f64 = 5.0 * 0.001;

pub fn core_width(core: f64, gamma: f64, age: f64) -> f64 {
    (core * core + CORE_GROWTH_RATE * gamma.abs() * age.max(0.0)).sqrt()
}

/// Velocity induced at `point` by the filament `a -> b` carrying `gamma`.
pub fn segment_velocity(
    a: &Vector3<f64>,
    b: &Vector3<f64>,
    point: &Vector3<f64>,
    gamma: f64,
    core: f64,
) -> Vector3<f64> {
    let r0 = b - a;
    let r1 = point - a;
    let r2 = point - b;

    let r1_norm = r1.norm();
    let r2_norm = r2.norm();
    if r1_norm < COINCIDENT_TOLERANCE || r2_norm < COINCIDENT_TOLERANCE {
        return Vector3::zeros();
    }

    let cross = r1.cross(&r2);
    let denominator = cross.norm_squared() + core * core * r0.norm_squared();
    if denominator < 1.0e-15 {
        return Vector3::zeros();
    }

    let projection = r0.dot(&(r1 / r1_norm - r2 / r2_norm));
    cross * (gamma * projection / (FOUR_PI * denominator))
}

/// Velocity induced by a filament starting at `start` and running to infinity
/// along `direction`.
pub fn semi_infinite_velocity(
    start: &Vector3<f64>,
    direction: &Vector3<f64>,
    point: &Vector3<f64>,
    gamma: f64,
    core: f64,
) -> Vector3<f64> {
    let dir_norm = direction.norm();
    if dir_norm < COINCIDENT_TOLERANCE {
        return Vector3::zeros();
    }
    let e = direction / dir_norm;
    let r1 = point - start;
    let r1_norm = r1.norm();
    if r1_norm < COINCIDENT_TOLERANCE {
        return Vector3::zeros();
    }

    let cross = e.cross(&r1);
    let denominator = cross.norm_squared() + core * core;
    if denominator < 1.0e-15 {
        return Vector3::zeros();
    }

    let cos_start = e.dot(&r1) / r1_norm;
    cross * (gamma * (1.0 + cos_start) / (FOUR_PI * denominator))
}
