// src/linalg_backends.rs

use ndarray::{Array1, Array2};
use std::error::Error;
use std::marker::PhantomData;

/// Dispatches to the linear algebra backend selected by cargo features.
#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider<F: 'static + Copy + Send + Sync> {
    _phantom: PhantomData<F>,
}

impl<F: 'static + Copy + Send + Sync> LinAlgBackendProvider<F> {
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

/// Output of a symmetric eigendecomposition.
#[derive(Debug)]
pub struct EighOutput<F: 'static> {
    /// Eigenvalues in ascending order.
    pub eigenvalues: Array1<F>,
    /// Eigenvectors as columns; `eigenvectors.column(i)` belongs to `eigenvalues[i]`.
    pub eigenvectors: Array2<F>,
}

/// Symmetric eigendecomposition reading the upper triangle.
pub trait BackendEigh<F: 'static + Copy + Send + Sync> {
    fn eigh_upper(&self, matrix: &Array2<F>) -> Result<EighOutput<F>, Box<dyn Error + Send + Sync>>;
}

/// Output of a Singular Value Decomposition.
///
/// Singular values are non-negative and in non-increasing order.
#[derive(Debug)]
pub struct SVDOutput<F: 'static> {
    pub u: Option<Array2<F>>,
    pub s: Array1<F>,
    pub vt: Option<Array2<F>>,
}

/// Singular Value Decomposition consuming its input.
pub trait BackendSVD<F: 'static + Copy + Send + Sync> {
    fn svd_into(
        &self,
        matrix: Array2<F>,
        compute_u: bool,
        compute_v: bool,
    ) -> Result<SVDOutput<F>, Box<dyn Error + Send + Sync>>;
}

// --- ndarray-linalg (LAPACK) backend ---
use ndarray_linalg::{Eigh as NdLinalgEigh, SVDInto as NdLinalgSVDInto, UPLO};

#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

fn to_dyn_error<E: Error + Send + Sync + 'static>(e: E) -> Box<dyn Error + Send + Sync> {
    Box::new(e)
}

impl BackendEigh<f64> for NdarrayLinAlgBackend {
    fn eigh_upper(
        &self,
        matrix: &Array2<f64>,
    ) -> Result<EighOutput<f64>, Box<dyn Error + Send + Sync>> {
        let (eigenvalues, eigenvectors) = matrix.eigh(UPLO::Upper).map_err(to_dyn_error)?;
        Ok(EighOutput { eigenvalues, eigenvectors })
    }
}

impl BackendSVD<f64> for NdarrayLinAlgBackend {
    fn svd_into(
        &self,
        matrix: Array2<f64>,
        compute_u: bool,
        compute_v: bool,
    ) -> Result<SVDOutput<f64>, Box<dyn Error + Send + Sync>> {
        let (u, s, vt) = matrix.svd_into(compute_u, compute_v).map_err(to_dyn_error)?;
        Ok(SVDOutput { u, s, vt })
    }
}

// --- faer backend ---
#[cfg(feature = "backend_faer")]
mod faer_specific_code {
    use super::{BackendEigh, BackendSVD, EighOutput, SVDOutput};
    use bytemuck::Pod;
    use faer::linalg::solvers::Svd as FaerSolverSvd;
    use faer::traits::num_traits::Zero;
    use faer::traits::ComplexField;
    use faer::MatRef;
    use ndarray::{Array1, Array2, ShapeBuilder};
    use std::error::Error;

    fn faer_error(msg: String) -> Box<dyn Error + Send + Sync> {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, msg))
    }

    #[derive(Debug, Default, Copy, Clone)]
    pub struct FaerLinAlgBackend;

    /// Borrows a contiguous ndarray matrix as a faer view without copying.
    fn faer_view(matrix: &Array2<f64>) -> Result<MatRef<'_, f64>, Box<dyn Error + Send + Sync>> {
        let (nrows, ncols) = matrix.dim();
        let slice = matrix.as_slice_memory_order().ok_or_else(|| {
            faer_error(format!(
                "Matrix ({}x{}) is not contiguous and cannot be viewed by faer.",
                nrows, ncols
            ))
        })?;
        if matrix.is_standard_layout() {
            Ok(MatRef::from_row_major_slice(slice, nrows, ncols))
        } else {
            Ok(MatRef::from_column_major_slice(slice, nrows, ncols))
        }
    }

    fn faer_mat_to_ndarray<F>(faer_mat: MatRef<'_, F>) -> Array2<F>
    where
        F: ComplexField + Copy + Pod + Zero,
    {
        let (nrows, ncols) = (faer_mat.nrows(), faer_mat.ncols());
        Array2::from_shape_fn((nrows, ncols).f(), |(i, j)| faer_mat[(i, j)])
    }

    fn faer_col_to_ndarray_vec<F>(faer_col: faer::ColRef<'_, F>) -> Array1<F>
    where
        F: ComplexField + Copy + Pod + Zero,
    {
        Array1::from_shape_fn(faer_col.nrows(), |i| faer_col[i])
    }

    impl BackendEigh<f64> for FaerLinAlgBackend {
        fn eigh_upper(
            &self,
            matrix: &Array2<f64>,
        ) -> Result<EighOutput<f64>, Box<dyn Error + Send + Sync>> {
            if matrix.nrows() != matrix.ncols() {
                return Err(faer_error("Matrix must be square for eigendecomposition.".to_string()));
            }
            if matrix.is_empty() {
                return Ok(EighOutput {
                    eigenvalues: Array1::zeros(0),
                    eigenvectors: Array2::zeros((0, 0)),
                });
            }
            let eig = faer_view(matrix)?
                .self_adjoint_eigen(faer::Side::Upper)
                .map_err(|e| faer_error(format!("faer eigendecomposition failed: {:?}", e)))?;
            Ok(EighOutput {
                eigenvalues: faer_col_to_ndarray_vec(eig.S().column_vector()),
                eigenvectors: faer_mat_to_ndarray(eig.U()),
            })
        }
    }

    impl BackendSVD<f64> for FaerLinAlgBackend {
        fn svd_into(
            &self,
            matrix: Array2<f64>,
            compute_u: bool,
            compute_v: bool,
        ) -> Result<SVDOutput<f64>, Box<dyn Error + Send + Sync>> {
            let (nrows, ncols) = matrix.dim();
            if matrix.is_empty() {
                let k = nrows.min(ncols);
                return Ok(SVDOutput {
                    u: compute_u.then(|| Array2::zeros((nrows, k))),
                    s: Array1::zeros(k),
                    vt: compute_v.then(|| Array2::zeros((k, ncols))),
                });
            }
            let svd = FaerSolverSvd::new_thin(faer_view(&matrix)?)
                .map_err(|e| faer_error(format!("faer SVD failed: {:?}", e)))?;

            let s = faer_col_to_ndarray_vec(svd.S().column_vector());
            let u = compute_u.then(|| faer_mat_to_ndarray(svd.U().as_ref()));
            let vt = compute_v.then(|| faer_mat_to_ndarray(svd.V().as_ref()).t().into_owned());
            Ok(SVDOutput { u, s, vt })
        }
    }
}

impl BackendEigh<f64> for LinAlgBackendProvider<f64> {
    fn eigh_upper(
        &self,
        matrix: &Array2<f64>,
    ) -> Result<EighOutput<f64>, Box<dyn Error + Send + Sync>> {
        #[cfg(feature = "backend_faer")]
        {
            faer_specific_code::FaerLinAlgBackend.eigh_upper(matrix)
        }
        #[cfg(not(feature = "backend_faer"))]
        {
            NdarrayLinAlgBackend.eigh_upper(matrix)
        }
    }
}

impl BackendSVD<f64> for LinAlgBackendProvider<f64> {
    fn svd_into(
        &self,
        matrix: Array2<f64>,
        compute_u: bool,
        compute_v: bool,
    ) -> Result<SVDOutput<f64>, Box<dyn Error + Send + Sync>> {
        #[cfg(feature = "backend_faer")]
        {
            faer_specific_code::FaerLinAlgBackend.svd_into(matrix, compute_u, compute_v)
        }
        #[cfg(not(feature = "backend_faer"))]
        {
            NdarrayLinAlgBackend.svd_into(matrix, compute_u, compute_v)
        }
    }
}
