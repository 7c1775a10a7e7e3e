use nalgebra::Vector3;

/// Anything that induces a velocity at an arbitrary point in space.
pub trait InducedVelocityField {
    /// Velocity induced at `point`, excluding the freestream.
    fn induced_velocity(&self, point: &Vector3<f64>) -> Vector3<f64>;
}

/// Wake unknowns exposed as a linear operator to a coupled Newton/GMRES solve.
///
/// Every implementation writes only the entries named by its own equation
/// numbers, so several wakes can share one global vector.
pub trait WakeLinearOperator {
    /// Scatters the stored node residuals into `residual`.
    fn calculate_wake_residual(&self, residual: &mut [f64]);

    /// Writes `J * vector` into `product`.
    fn wake_matrix_multiply(&self, vector: &[f64], product: &mut [f64]);

    /// Replaces `residual` with an approximate `J^-1 * residual`.
    fn wake_forward_precondition(&self, residual: &mut [f64]);

    /// Adds `J^T * vector` into `product`.
    fn wake_transpose_multiply(&self, vector: &[f64], product: &mut [f64]);
}
