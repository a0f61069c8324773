use ndarray::{s, Array1, Array2, ArrayView2};
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use crate::prelude::{ensure_shape, StageError, StageResult};

/// Helper that wraps `rustfft` plans for separable two-dimensional transforms.
pub struct FftHelper {
    rows: usize,
    cols: usize,
    row_forward: Arc<dyn Fft<f64>>,
    col_forward: Arc<dyn Fft<f64>>,
    row_inverse: Arc<dyn Fft<f64>>,
    col_inverse: Arc<dyn Fft<f64>>,
}

impl FftHelper {
    pub fn new(rows: usize, cols: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            rows,
            cols,
            row_forward: planner.plan_fft_forward(cols),
            col_forward: planner.plan_fft_forward(rows),
            row_inverse: planner.plan_fft_inverse(cols),
            col_inverse: planner.plan_fft_inverse(rows),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Forward transform of a real plane.
    pub fn forward_real(&self, data: ArrayView2<f64>) -> StageResult<Array2<Complex64>> {
        ensure_shape("fft input", self.shape(), data.dim())?;
        let mut buffer = data.mapv(|value| Complex64::new(value, 0.0));
        self.forward(&mut buffer)?;
        Ok(buffer)
    }

    pub fn forward(&self, data: &mut Array2<Complex64>) -> StageResult<()> {
        ensure_shape("fft input", self.shape(), data.dim())?;
        apply_separable(data, self.row_forward.as_ref(), self.col_forward.as_ref());
        Ok(())
    }

    /// Inverse transform, normalized so that `inverse(forward(x)) == x`.
    pub fn inverse(&self, data: &mut Array2<Complex64>) -> StageResult<()> {
        ensure_shape("ifft input", self.shape(), data.dim())?;
        apply_separable(data, self.row_inverse.as_ref(), self.col_inverse.as_ref());
        let norm = 1.0 / (self.rows * self.cols) as f64;
        data.mapv_inplace(|value| value * norm);
        Ok(())
    }
}

fn apply_separable(data: &mut Array2<Complex64>, row_fft: &dyn Fft<f64>, col_fft: &dyn Fft<f64>) {
    let mut buffer: Vec<Complex64> = Vec::with_capacity(data.nrows().max(data.ncols()));

    for mut row in data.rows_mut() {
        buffer.clear();
        buffer.extend(row.iter().copied());
        row_fft.process(&mut buffer);
        row.iter_mut()
            .zip(buffer.iter())
            .for_each(|(dst, src)| *dst = *src);
    }

    for mut col in data.columns_mut() {
        buffer.clear();
        buffer.extend(col.iter().copied());
        col_fft.process(&mut buffer);
        col.iter_mut()
            .zip(buffer.iter())
            .for_each(|(dst, src)| *dst = *src);
    }
}

/// Moves the zero-frequency sample to index `n / 2` along both axes.
pub fn fftshift<T: Clone>(data: &Array2<T>) -> Array2<T> {
    let (rows, cols) = data.dim();
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        data[[(r + rows - rows / 2) % rows, (c + cols - cols / 2) % cols]].clone()
    })
}

/// Sample frequencies in cycles/pixel, already shifted so that index `n / 2` is zero.
pub fn fftfreq_shifted(n: usize) -> Array1<f64> {
    let half = (n / 2) as f64;
    Array1::from_shape_fn(n, |j| (j as f64 - half) / n as f64)
}

/// Linear convolution with zero fill outside `array`, cropped to the shape of `array`.
///
/// The kernel origin sits at `(ky / 2, kx / 2)`. With `normalize_kernel` the kernel is
/// scaled to unit sum first.
pub fn convolve_fft(
    array: ArrayView2<f64>,
    kernel: ArrayView2<f64>,
    normalize_kernel: bool,
) -> StageResult<Array2<f64>> {
    let (ny, nx) = array.dim();
    let (ky, kx) = kernel.dim();
    if ny == 0 || nx == 0 || ky == 0 || kx == 0 {
        return Err(StageError::InvalidInput(
            "convolution requires non-empty array and kernel".into(),
        ));
    }

    let scale = if normalize_kernel {
        let total = kernel.sum();
        if total == 0.0 || !total.is_finite() {
            return Err(StageError::InvalidInput(format!(
                "cannot normalize kernel with sum {}",
                total
            )));
        }
        1.0 / total
    } else {
        1.0
    };

    let padded = (ny + ky - 1, nx + kx - 1);
    let helper = FftHelper::new(padded.0, padded.1);

    let mut signal = Array2::<Complex64>::zeros(padded);
    signal
        .slice_mut(s![..ny, ..nx])
        .zip_mut_with(&array, |dst, &value| *dst = Complex64::new(value, 0.0));

    let mut response = Array2::<Complex64>::zeros(padded);
    response
        .slice_mut(s![..ky, ..kx])
        .zip_mut_with(&kernel, |dst, &value| *dst = Complex64::new(value * scale, 0.0));

    helper.forward(&mut signal)?;
    helper.forward(&mut response)?;
    signal.zip_mut_with(&response, |a, b| *a *= *b);
    helper.inverse(&mut signal)?;

    let (cy, cx) = (ky / 2, kx / 2);
    Ok(Array2::from_shape_fn((ny, nx), |(r, c)| signal[[r + cy, c + cx]].re))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn forward_of_impulse_is_flat() {
        let helper = FftHelper::new(4, 6);
        let mut impulse = Array2::<f64>::zeros((4, 6));
        impulse[[0, 0]] = 1.0;
        let spectrum = helper.forward_real(impulse.view()).unwrap();
        for value in spectrum.iter() {
            assert_abs_diff_eq!(value.re, 1.0, epsilon = 1e-12);
            assert_abs_diff_eq!(value.im, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn inverse_restores_input() {
        let helper = FftHelper::new(3, 5);
        let data = Array2::from_shape_fn((3, 5), |(r, c)| (r * 5 + c) as f64 * 0.5 - 2.0);
        let mut spectrum = helper.forward_real(data.view()).unwrap();
        helper.inverse(&mut spectrum).unwrap();
        for (restored, original) in spectrum.iter().zip(data.iter()) {
            assert_abs_diff_eq!(restored.re, *original, epsilon = 1e-10);
        }
    }

    #[test]
    fn helper_rejects_wrong_shape() {
        let helper = FftHelper::new(4, 4);
        let data = Array2::<f64>::zeros((4, 5));
        assert!(matches!(
            helper.forward_real(data.view()),
            Err(StageError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn fftshift_matches_numpy_for_even_and_odd() {
        let even = array![[0, 1, 2, 3]];
        assert_eq!(fftshift(&even), array![[2, 3, 0, 1]]);
        let odd = array![[0, 1, 2, 3, 4]];
        assert_eq!(fftshift(&odd), array![[3, 4, 0, 1, 2]]);
    }

    #[test]
    fn shifted_frequencies_center_zero() {
        let freqs = fftfreq_shifted(4);
        assert_eq!(freqs.to_vec(), vec![-0.5, -0.25, 0.0, 0.25]);
        let freqs = fftfreq_shifted(5);
        assert_abs_diff_eq!(freqs[0], -0.4, epsilon = 1e-15);
        assert_eq!(freqs[2], 0.0);
    }

    #[test]
    fn convolve_with_centered_delta_is_identity() {
        let data = Array2::from_shape_fn((5, 4), |(r, c)| (r as f64 - c as f64).powi(2));
        let mut kernel = Array2::<f64>::zeros((3, 3));
        kernel[[1, 1]] = 2.0;
        let out = convolve_fft(data.view(), kernel.view(), true).unwrap();
        for (a, b) in out.iter().zip(data.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn convolve_fills_with_zero_at_edges() {
        let data = Array2::<f64>::ones((3, 3));
        let kernel = Array2::<f64>::ones((3, 3));
        let out = convolve_fft(data.view(), kernel.view(), false).unwrap();
        assert_abs_diff_eq!(out[[1, 1]], 9.0, epsilon = 1e-10);
        assert_abs_diff_eq!(out[[0, 0]], 4.0, epsilon = 1e-10);
        assert_abs_diff_eq!(out[[0, 1]], 6.0, epsilon = 1e-10);
    }

    #[test]
    fn convolve_rejects_zero_sum_kernel_when_normalizing() {
        let data = Array2::<f64>::ones((3, 3));
        let kernel = array![[1.0, -1.0]];
        assert!(convolve_fft(data.view(), kernel.view(), true).is_err());
    }
}
