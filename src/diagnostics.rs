// src/diagnostics.rs

//! Numerical health checks for fitted whitening models and their outputs.

use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Computes the Frobenius norm of a matrix.
pub fn compute_frob_norm(matrix: &ArrayView2<f64>) -> f64 {
    if matrix.is_empty() {
        return 0.0;
    }
    matrix.iter().map(|&x| x * x).sum::<f64>().sqrt()
}

/// Computes the orthogonality error ||I - Q^T Q||_F of the columns of `q_matrix`.
pub fn compute_orthogonality_error(q_matrix: &ArrayView2<f64>) -> Option<f64> {
    if q_matrix.nrows() == 0 || q_matrix.ncols() == 0 {
        return None;
    }
    let qtq = q_matrix.t().dot(q_matrix);
    let diff = Array2::<f64>::eye(qtq.nrows()) - qtq;
    Some(compute_frob_norm(&diff.view()))
}

/// Bessel-corrected sample variance of every row (rows are features, columns samples).
pub fn row_sample_variances(matrix: &ArrayView2<f64>) -> Option<Array1<f64>> {
    if matrix.ncols() < 2 {
        return None;
    }
    Some(matrix.var_axis(Axis(1), 1.0))
}

/// Computes ||cov(X) - I||_F for a features x samples matrix.
///
/// Zero for perfectly white data.
pub fn compute_whiteness_error(matrix: &ArrayView2<f64>) -> Option<f64> {
    let n_samples = matrix.ncols();
    if matrix.nrows() == 0 || n_samples < 2 {
        return None;
    }
    let mean = matrix.mean_axis(Axis(1))?;
    let centered = matrix - &mean.insert_axis(Axis(1));
    let covariance = centered.dot(&centered.t()) / (n_samples - 1) as f64;
    let diff = covariance - Array2::<f64>::eye(matrix.nrows());
    Some(compute_frob_norm(&diff.view()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn identity_has_no_orthogonality_error() {
        let eye = Array2::<f64>::eye(3);
        let err = compute_orthogonality_error(&eye.view()).unwrap();
        assert!(err < 1e-12);
    }

    #[test]
    fn scaled_columns_are_not_orthonormal() {
        let m = array![[2.0, 0.0], [0.0, 1.0]];
        let err = compute_orthogonality_error(&m.view()).unwrap();
        assert!((err - 3.0).abs() < 1e-12);
    }

    #[test]
    fn row_variances_need_two_samples() {
        let m = array![[1.0], [2.0]];
        assert!(row_sample_variances(&m.view()).is_none());
        let m = array![[1.0, 3.0], [2.0, 2.0]];
        let vars = row_sample_variances(&m.view()).unwrap();
        assert!((vars[0] - 2.0).abs() < 1e-12);
        assert!(vars[1].abs() < 1e-12);
    }

    #[test]
    fn empty_matrix_yields_none() {
        let m = Array2::<f64>::zeros((0, 0));
        assert!(compute_orthogonality_error(&m.view()).is_none());
        assert!(compute_whiteness_error(&m.view()).is_none());
        assert_eq!(compute_frob_norm(&m.view()), 0.0);
    }
}
