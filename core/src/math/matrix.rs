use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};

/// Bridges the `ndarray` normal equations of the fitter to `nalgebra` decompositions.
pub struct MatrixHelper;

impl MatrixHelper {
    /// Solves `a · x = b` through an LU decomposition with partial pivoting.
    ///
    /// Returns `None` for non-square, singular or numerically degenerate systems.
    pub fn solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
        if !a.is_square() || b.len() != a.nrows() {
            return None;
        }
        let rhs = DVector::from_iterator(b.len(), b.iter().copied());
        let solution = Self::to_dmatrix(a).lu().solve(&rhs)?;
        if !solution.iter().all(|v| v.is_finite()) {
            return None;
        }
        Some(Array1::from_iter(solution.iter().copied()))
    }

    /// Inverse of a square matrix, `None` when singular.
    pub fn invert(a: &Array2<f64>) -> Option<Array2<f64>> {
        if !a.is_square() {
            return None;
        }
        let inverse = Self::to_dmatrix(a).try_inverse()?;
        if !inverse.iter().all(|v| v.is_finite()) {
            return None;
        }
        Some(Array2::from_shape_fn(a.dim(), |(r, c)| inverse[(r, c)]))
    }

    fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
        DMatrix::from_row_iterator(a.nrows(), a.ncols(), a.iter().copied())
    }
}
