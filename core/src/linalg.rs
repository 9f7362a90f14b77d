//! Linear algebra helpers for covariance square roots and SPD solves.
//!
//! Public API:
//!     pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn cholesky_sqrt(matrix: &DMatrix<f64>) -> Result<DMatrix<f64>, FilterError>
//!     pub fn spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>, FilterError>
//!     pub fn spd_solve_vector(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>, FilterError>
//!
//! A covariance that fails Cholesky factorization is corrupted filter state,
//! not a numerical hiccup to paper over, so there is no jitter ramp and no
//! eigenvalue-floor fallback here: failure is surfaced as a [FilterError] and
//! the caller aborts the update with its state untouched.

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector};

use crate::FilterError;

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
///
/// Simple matrix symmetrization function that reduces round-off errors
/// associated with floating point arithmetic.
///
/// # Arguments
/// * `m` - the matrix to symmetrize
///
/// # Returns
/// A symmetrized version of the input matrix.
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

/// Compute the lower Cholesky factor `L` such that `matrix ≈ L * Lᵀ`.
///
/// The input is symmetrized first to kill round-off asymmetry. If the matrix
/// is not positive definite the factorization fails and
/// [FilterError::CovarianceNotPositiveDefinite] is returned.
///
/// # Arguments
/// * `matrix` - The matrix to factor. Must be square.
///
/// # Returns
/// * `Ok(DMatrix<f64>)` containing the lower triangular Cholesky factor.
/// * `Err(FilterError::CovarianceNotPositiveDefinite)` if factorization fails.
pub fn cholesky_sqrt(matrix: &DMatrix<f64>) -> Result<DMatrix<f64>, FilterError> {
    assert!(matrix.is_square(), "cholesky_sqrt: matrix must be square");
    Cholesky::new(symmetrize(matrix))
        .map(|chol| chol.l())
        .ok_or(FilterError::CovarianceNotPositiveDefinite)
}

/// Solve `A X = B` for symmetric positive definite `A` via Cholesky.
///
/// # Arguments
/// * `a` - The SPD left-hand side. Symmetrized before factoring.
/// * `b` - The right-hand side matrix.
///
/// # Returns
/// * `Ok(DMatrix<f64>)` containing `X`.
/// * `Err(FilterError::SingularInnovationCovariance)` if `A` is not positive
///   definite.
pub fn spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>, FilterError> {
    assert!(a.is_square(), "spd_solve: A must be square");
    assert_eq!(a.nrows(), b.nrows(), "spd_solve: A and B incompatible");
    Cholesky::new(symmetrize(a))
        .map(|chol| chol.solve(b))
        .ok_or(FilterError::SingularInnovationCovariance)
}

/// Solve `A x = b` for a single right-hand-side vector. See [spd_solve].
pub fn spd_solve_vector(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>, FilterError> {
    assert!(a.is_square(), "spd_solve_vector: A must be square");
    assert_eq!(a.nrows(), b.nrows(), "spd_solve_vector: A and b incompatible");
    Cholesky::new(symmetrize(a))
        .map(|chol| chol.solve(b))
        .ok_or(FilterError::SingularInnovationCovariance)
}

/* =============================== Tests ==================================== */
