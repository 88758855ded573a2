//! The few dense linear-algebra kernels the EM needs.
//!
//! All matrices inverted here are small (latent-by-latent) and symmetric positive
//! definite in exact arithmetic. LU is used for the inverse and the log
//! determinant; an estimated 1-norm condition number decides whether the result is
//! trusted or whether a ridge has to be added to the diagonal.

use ndarray::{Array2, ArrayView2};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Determinant, Inverse};
use thiserror::Error;

/// Inverses whose estimated condition number exceeds this are retried with a ridge.
pub const MAX_CONDITION_NUMBER: f64 = 1.0e12;

const INITIAL_RIDGE_FRACTION: f64 = 1.0e-10;
const MAX_RIDGE_ATTEMPTS: usize = 12;

#[derive(Error, Debug)]
pub enum InversionError {
    #[error("Only square matrices can be inverted, but the matrix is {rows}x{cols}.")]
    NotSquare { rows: usize, cols: usize },

    #[error("LAPACK failure while factorizing: {0}")]
    Lapack(#[from] LinalgError),

    #[error("Matrix stayed singular even with a ridge of {ridge:.3e} on the diagonal.")]
    Singular { ridge: f64 },
}

/// Inverse of a (possibly ridge-regularized) matrix together with its log determinant.
#[derive(Debug, Clone)]
pub struct GuardedInverse {
    pub inverse: Array2<f64>,
    /// `ln |det(A + ridge I)|`
    pub log_det: f64,
    /// Zero unless the matrix had to be regularized.
    pub ridge: f64,
}

/// Maximum absolute column sum.
pub fn one_norm(matrix: ArrayView2<f64>) -> f64 {
    matrix
        .columns()
        .into_iter()
        .map(|column| column.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0, f64::max)
}

/// LU inverse of `matrix` guarded against singular or ill-conditioned input.
///
/// When the plain inverse fails or its estimated condition number exceeds
/// [`MAX_CONDITION_NUMBER`], a ridge proportional to the largest diagonal entry is
/// added and grown tenfold until the inverse is acceptable. The last attempt is
/// accepted as long as LU succeeds at all.
pub fn guarded_inverse(matrix: ArrayView2<f64>) -> Result<GuardedInverse, InversionError> {
    let (rows, cols) = matrix.dim();
    if rows != cols {
        return Err(InversionError::NotSquare { rows, cols });
    }

    let scale = matrix
        .diag()
        .iter()
        .map(|v| v.abs())
        .fold(0.0, f64::max)
        .max(1.0);

    let mut ridge = 0.0;
    for attempt in 0..=MAX_RIDGE_ATTEMPTS {
        let mut candidate = matrix.to_owned();
        if ridge > 0.0 {
            candidate.diag_mut().mapv_inplace(|v| v + ridge);
        }

        if let Ok(inverse) = candidate.inv() {
            let condition = one_norm(candidate.view()) * one_norm(inverse.view());
            let acceptable = condition.is_finite() && condition <= MAX_CONDITION_NUMBER;
            if acceptable || (attempt == MAX_RIDGE_ATTEMPTS && inverse.iter().all(|v| v.is_finite()))
            {
                let (sign, log_abs_det) = candidate.sln_det()?;
                if sign <= 0.0 {
                    log::debug!(
                        "Inverted matrix is not positive definite (determinant sign {}).",
                        sign
                    );
                }
                if ridge > 0.0 {
                    log::warn!(
                        "Ill-conditioned {}x{} matrix inverted with a ridge of {:.3e} (condition estimate {:.3e}).",
                        rows,
                        cols,
                        ridge,
                        condition
                    );
                }
                return Ok(GuardedInverse {
                    inverse,
                    log_det: log_abs_det,
                    ridge,
                });
            }
        }

        ridge = if ridge == 0.0 {
            INITIAL_RIDGE_FRACTION * scale
        } else {
            ridge * 10.0
        };
    }

    Err(InversionError::Singular { ridge })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_well_conditioned_inverse_is_exact() {
        let matrix = array![[4.0, 1.0], [1.0, 3.0]];
        let result = guarded_inverse(matrix.view()).unwrap();
        assert_eq!(result.ridge, 0.0);
        assert_abs_diff_eq!(result.log_det, 11.0_f64.ln(), epsilon = 1e-12);
        let identity = matrix.dot(&result.inverse);
        assert_abs_diff_eq!(identity, Array2::eye(2), epsilon = 1e-12);
    }

    #[test]
    fn test_singular_matrix_falls_back_to_ridge() {
        let matrix = array![[1.0, 1.0], [1.0, 1.0]];
        let result = guarded_inverse(matrix.view()).unwrap();
        assert!(result.ridge > 0.0);
        assert!(result.inverse.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_rejects_non_square() {
        let matrix = Array2::<f64>::zeros((2, 3));
        assert!(matches!(
            guarded_inverse(matrix.view()),
            Err(InversionError::NotSquare { rows: 2, cols: 3 })
        ));
    }

    #[test]
    fn test_one_norm() {
        let matrix = array![[1.0, -4.0], [-2.0, 1.0]];
        assert_eq!(one_norm(matrix.view()), 5.0);
    }
}
