//! Implicit residual smoothing along a single filament.
//!
//! Every smoother here solves `(1 + eps) u_i - eps/2 (u_{i-1} + u_{i+1}) = r_i`
//! with the first and last entries held fixed.

use num_traits::Float;

/// Thomas algorithm for a tridiagonal system. `lower[0]` and `upper[n-1]` are ignored.
pub fn solve_tridiagonal<T: Float>(lower: &[T], diag: &[T], upper: &[T], rhs: &[T]) -> Vec<T> {
    let n = rhs.len();
    if n == 0 {
        return Vec::new();
    }
    let mut b = diag.to_vec();
    let mut d = rhs.to_vec();
    for i in 1..n {
        let m = lower[i] / b[i - 1];
        b[i] = b[i] - m * upper[i - 1];
        d[i] = d[i] - m * d[i - 1];
    }
    let mut x = vec![T::zero(); n];
    x[n - 1] = d[n - 1] / b[n - 1];
    for i in (0..n - 1).rev() {
        x[i] = (d[i] - upper[i] * x[i + 1]) / b[i];
    }
    x
}

/// Smooths `values` in place. `eps(i)` returns `None` to pin an interior entry.
pub fn implicit_smooth<T, F>(values: &mut [T], eps: F)
where
    T: Float,
    F: Fn(usize) -> Option<T>,
{
    let n = values.len();
    if n < 3 {
        return;
    }
    let half = T::one() / (T::one() + T::one());
    let mut lower = vec![T::zero(); n];
    let mut diag = vec![T::one(); n];
    let mut upper = vec![T::zero(); n];
    for i in 1..n - 1 {
        if let Some(e) = eps(i) {
            lower[i] = -half * e;
            diag[i] = T::one() + e;
            upper[i] = -half * e;
        }
    }
    let smoothed = solve_tridiagonal(&lower, &diag, &upper, values);
    values.copy_from_slice(&smoothed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tridiagonal_solves_known_system() {
        // [2 -1 0; -1 2 -1; 0 -1 2] x = [1 0 1] -> x = [1 1 1]
        let lower = [0.0, -1.0, -1.0];
        let diag = [2.0, 2.0, 2.0];
        let upper = [-1.0, -1.0, 0.0];
        let x = solve_tridiagonal(&lower, &diag, &upper, &[1.0, 0.0, 1.0]);
        for xi in x {
            assert!((xi - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn smoothing_preserves_linear_profiles_and_ends() {
        let mut values: Vec<f64> = (0..9).map(|i| 2.0 * i as f64 - 3.0).collect();
        let original = values.clone();
        implicit_smooth(&mut values, |_| Some(0.25));
        for (a, b) in values.iter().zip(&original) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn smoothing_damps_a_spike() {
        let mut values = vec![0.0f64; 7];
        values[3] = 1.0;
        implicit_smooth(&mut values, |_| Some(0.5));
        assert!(values[3] < 1.0);
        assert!(values[2] > 0.0 && values[4] > 0.0);
        assert_eq!(values[0], 0.0);
        assert_eq!(values[6], 0.0);
    }

    #[test]
    fn pinned_rows_are_untouched() {
        let mut values = vec![0.0f64, 1.0, 0.0, 0.0, 0.0];
        implicit_smooth(&mut values, |i| if i == 1 { None } else { Some(1.0) });
        assert_eq!(values[1], 1.0);
        assert!(values[2] > 0.0);
    }
}
