//! Configuration shared by every trail and sheet of one wake.
//!
//! All of these are plain `Copy` values. A sheet hands its [`WakeConfig`] to
//! each trail it owns, so there is no process-wide state.

use anyhow::{bail, Result};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WakeSettings {
    /// Distance-to-length ratio beyond which an agglomerated edge is used as is.
    pub far_away: f64,
    pub mach: f64,
    /// User relaxation; the committed node update is `0.85 * wake_relax`.
    pub wake_relax: f64,
    pub core_size_factor: f64,
    pub ground_effects: bool,
    pub karman_tsien: bool,
    pub vortex_stretching: bool,
}

impl Default for WakeSettings {
    fn default() -> Self {
        Self {
            far_away: 5.0,
            mach: 0.0,
            wake_relax: 1.0,
            core_size_factor: 1.0,
            ground_effects: false,
            karman_tsien: true,
            vortex_stretching: false,
        }
    }
}

impl WakeSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.far_away > 0.0) {
            bail!("far_away must be positive.");
        }
        if self.mach < 0.0 || !self.mach.is_finite() {
            bail!("mach must be a finite, non-negative number.");
        }
        if !(self.wake_relax > 0.0) {
            bail!("wake_relax must be positive.");
        }
        if !(self.core_size_factor > 0.0) {
            bail!("core_size_factor must be positive.");
        }
        Ok(())
    }

    pub fn relaxation(&self) -> f64 {
        0.85 * self.wake_relax
    }

    /// Approximate compressibility correction applied to Kutta velocities.
    pub fn karman_tsien_factor(&self) -> f64 {
        if self.karman_tsien {
            (1.0 + 0.25 * self.mach * self.mach).powi(2)
        } else {
            1.0
        }
    }
}

/// How the wake evolves between outer iterations.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SolverMode {
    /// Converged wake shape, trailing-edge circulation carried to infinity.
    #[default]
    Steady,
    /// Geometry marched in time but the wake still ends in a semi-infinite tail.
    QuasiSteady { time_step: f64 },
    /// Circulation convected one slot per step and starting vortices retained.
    TimeAccurate { time_step: f64 },
}

impl SolverMode {
    pub fn time_step(&self) -> Option<f64> {
        match self {
            SolverMode::Steady => None,
            SolverMode::QuasiSteady { time_step } | SolverMode::TimeAccurate { time_step } => {
                Some(*time_step)
            }
        }
    }

    pub fn is_time_accurate(&self) -> bool {
        matches!(self, SolverMode::TimeAccurate { .. })
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(dt) = self.time_step() {
            if !(dt > 0.0) || !dt.is_finite() {
                bail!("time_step must be positive.");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Freestream {
    pub velocity: Vector3<f64>,
}

impl Freestream {
    pub fn new(velocity: Vector3<f64>) -> Self {
        Self { velocity }
    }

    pub fn speed(&self) -> f64 {
        self.velocity.norm()
    }

    pub fn direction(&self) -> Vector3<f64> {
        let speed = self.speed();
        if speed > 0.0 {
            self.velocity / speed
        } else {
            Vector3::x()
        }
    }
}

impl Default for Freestream {
    fn default() -> Self {
        Self::new(Vector3::x())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RotorSettings {
    pub rpm: f64,
    pub origin: Vector3<f64>,
    pub thrust_vector: Vector3<f64>,
}

impl RotorSettings {
    pub fn validate(&self) -> Result<()> {
        if self.rpm == 0.0 || !self.rpm.is_finite() {
            bail!("rotor rpm must be finite and non-zero.");
        }
        if self.thrust_vector.norm() <= 0.0 {
            bail!("rotor thrust_vector must be non-zero.");
        }
        Ok(())
    }

    /// Rotation rate in rad/s.
    pub fn omega(&self) -> f64 {
        self.rpm * 2.0 * PI / 60.0
    }

    pub fn thrust_direction(&self) -> Vector3<f64> {
        let norm = self.thrust_vector.norm();
        if norm > 0.0 {
            self.thrust_vector / norm
        } else {
            Vector3::z()
        }
    }

    /// Angular velocity vector of the wake frame, spinning opposite the blade.
    pub fn angular_velocity(&self) -> Vector3<f64> {
        -self.omega() * self.thrust_direction()
    }

    /// Time for the blade to sweep 18 degrees, used as the helical node spacing.
    pub fn helix_time_step(&self) -> f64 {
        (18.0 * PI / 180.0) / self.omega().abs()
    }

    /// First-guess direction along which a rotor wake is laid out.
    pub fn initial_wake_direction(&self, freestream: &Freestream) -> Vector3<f64> {
        let dir = -0.1 * self.thrust_direction() + 0.9 * freestream.direction();
        let norm = dir.norm();
        if norm > 0.0 {
            dir / norm
        } else {
            freestream.direction()
        }
    }

    /// Unit freestream component perpendicular to the thrust axis (zero in axial flow).
    pub fn in_plane_direction(&self, freestream: &Freestream) -> Vector3<f64> {
        let thrust = self.thrust_direction();
        let dir = freestream.direction();
        let in_plane = dir - dir.dot(&thrust) * thrust;
        let norm = in_plane.norm();
        if norm > 0.0 {
            in_plane / norm
        } else {
            Vector3::zeros()
        }
    }
}

/// Everything a trail needs to know about the flow it lives in.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WakeConfig {
    pub settings: WakeSettings,
    pub mode: SolverMode,
    pub freestream: Freestream,
    #[serde(default)]
    pub rotor: Option<RotorSettings>,
}

impl WakeConfig {
    pub fn validate(&self) -> Result<()> {
        self.settings.validate()?;
        self.mode.validate()?;
        if !(self.freestream.speed() > 0.0) {
            bail!("freestream speed must be positive.");
        }
        if let Some(rotor) = &self.rotor {
            rotor.validate()?;
        }
        Ok(())
    }
}
