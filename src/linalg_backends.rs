// src/linalg_backends.rs

use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayView2};

use crate::error::{Result, SurveyStatsError};

/// Output of a symmetric eigendecomposition.
#[derive(Debug)]
pub struct EighOutput {
    /// Eigenvalues, in the order the backend produced them (ascending for faer).
    pub eigenvalues: Array1<f64>,
    /// Eigenvectors as columns of the matrix.
    /// eigenvectors.column(i) corresponds to eigenvalues[i].
    pub eigenvectors: Array2<f64>,
}

/// Trait for symmetric eigendecomposition. Only the upper triangle is read.
pub trait BackendEigh {
    fn eigh_upper(&self, matrix: ArrayView2<f64>) -> Result<EighOutput>;
}

/// Output of a thin Singular Value Decomposition, `A = U diag(s) Vt`.
#[derive(Debug)]
pub struct SVDOutput {
    /// Shape: (nrows, k)
    pub u: Array2<f64>,
    /// Singular values, non-increasing. Length k = min(nrows, ncols).
    pub s: Array1<f64>,
    /// Shape: (k, ncols)
    pub vt: Array2<f64>,
}

/// Trait for thin Singular Value Decomposition.
pub trait BackendSVD {
    fn thin_svd(&self, matrix: ArrayView2<f64>) -> Result<SVDOutput>;
}

/// Pure-Rust backend on top of `faer`.
#[derive(Debug, Default, Copy, Clone)]
pub struct FaerLinAlgBackend;

fn ndarray_to_faer(matrix: ArrayView2<f64>) -> Mat<f64> {
    Mat::from_fn(matrix.nrows(), matrix.ncols(), |i, j| matrix[[i, j]])
}

fn faer_mat_to_ndarray(faer_mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((faer_mat.nrows(), faer_mat.ncols()), |(i, j)| faer_mat[(i, j)])
}

impl BackendEigh for FaerLinAlgBackend {
    fn eigh_upper(&self, matrix: ArrayView2<f64>) -> Result<EighOutput> {
        if matrix.nrows() != matrix.ncols() {
            return Err(SurveyStatsError::Linalg(format!(
                "matrix must be square for eigendecomposition (found {}x{})",
                matrix.nrows(),
                matrix.ncols()
            )));
        }
        if matrix.is_empty() {
            return Ok(EighOutput {
                eigenvalues: Array1::zeros(0),
                eigenvectors: Array2::zeros((0, 0)),
            });
        }
        let faer_mat = ndarray_to_faer(matrix);
        let eig = faer_mat
            .as_ref()
            .self_adjoint_eigen(Side::Upper)
            .map_err(|e| SurveyStatsError::Linalg(format!("eigendecomposition failed: {:?}", e)))?;
        let values = eig.S().column_vector();
        let eigenvalues = Array1::from_shape_fn(values.nrows(), |i| values[i]);
        Ok(EighOutput {
            eigenvalues,
            eigenvectors: faer_mat_to_ndarray(eig.U()),
        })
    }
}

impl BackendSVD for FaerLinAlgBackend {
    fn thin_svd(&self, matrix: ArrayView2<f64>) -> Result<SVDOutput> {
        let (nrows, ncols) = matrix.dim();
        if matrix.is_empty() {
            let k = nrows.min(ncols);
            return Ok(SVDOutput {
                u: Array2::zeros((nrows, k)),
                s: Array1::zeros(k),
                vt: Array2::zeros((k, ncols)),
            });
        }
        let faer_mat = ndarray_to_faer(matrix);
        let svd = faer_mat
            .as_ref()
            .thin_svd()
            .map_err(|e| SurveyStatsError::Linalg(format!("SVD failed: {:?}", e)))?;
        let values = svd.S().column_vector();
        let s = Array1::from_shape_fn(values.nrows(), |i| values[i]);
        let u = faer_mat_to_ndarray(svd.U());
        let vt = faer_mat_to_ndarray(svd.V()).reversed_axes();
        Ok(SVDOutput { u, s, vt })
    }
}

/// Orthogonal polar factor `U Vt` of a square matrix, the closest orthogonal
/// matrix in Frobenius norm. Also returns the sum of singular values.
pub(crate) fn orthogonal_polar_factor<B: BackendSVD>(
    backend: &B,
    matrix: ArrayView2<f64>,
) -> Result<(Array2<f64>, f64)> {
    let svd = backend.thin_svd(matrix)?;
    Ok((svd.u.dot(&svd.vt), svd.s.sum()))
}

/// Inverse of a symmetric positive-definite matrix via its eigendecomposition.
pub(crate) fn symmetric_inverse<B: BackendEigh>(
    backend: &B,
    matrix: ArrayView2<f64>,
) -> Result<Array2<f64>> {
    let eig = backend.eigh_upper(matrix)?;
    let largest = eig.eigenvalues.iter().fold(0.0_f64, |acc, &v| acc.max(v.abs()));
    let threshold = largest.max(1.0) * 1e-12;
    if eig.eigenvalues.iter().any(|&v| v <= threshold) {
        return Err(SurveyStatsError::Linalg(
            "matrix is singular or not positive definite".to_string(),
        ));
    }
    let inv_values = eig.eigenvalues.mapv(|v| 1.0 / v);
    // V diag(1/lambda) Vt
    let scaled = &eig.eigenvectors * &inv_values;
    Ok(scaled.dot(&eig.eigenvectors.t()))
}
