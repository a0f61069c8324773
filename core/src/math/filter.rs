//! Gaussian kernels and separable Gaussian filtering.

use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Kernel radius in units of sigma for separable filtering.
pub const GAUSSIAN_TRUNCATE: f64 = 4.0;

/// Normalized 1D Gaussian sampled at integer offsets `-r..=r`, `r = round(truncate·σ)`.
pub fn gaussian_kernel_1d(sigma: f64, truncate: f64) -> Array1<f64> {
    let radius = (truncate * sigma + 0.5).floor().max(0.0) as usize;
    let mut kernel = Array1::from_shape_fn(2 * radius + 1, |i| {
        let x = (i as f64 - radius as f64) / sigma;
        (-0.5 * x * x).exp()
    });
    let total = kernel.sum();
    kernel.mapv_inplace(|v| v / total);
    kernel
}

/// Normalized 2D Gaussian detection kernel with odd side `round_up_odd(8σ)`.
pub fn gaussian_kernel_2d(sigma: f64) -> Array2<f64> {
    let mut size = (8.0 * sigma).ceil().max(1.0) as usize;
    if size % 2 == 0 {
        size += 1;
    }
    let center = (size / 2) as f64;
    let mut kernel = Array2::from_shape_fn((size, size), |(r, c)| {
        let dy = (r as f64 - center) / sigma;
        let dx = (c as f64 - center) / sigma;
        (-0.5 * (dx * dx + dy * dy)).exp()
    });
    let total = kernel.sum();
    kernel.mapv_inplace(|v| v / total);
    kernel
}

/// Maps an out-of-range index back into `0..n` with half-sample symmetric reflection
/// (`d c b a | a b c d | d c b a`).
fn reflect_index(index: isize, n: usize) -> usize {
    let n = n as isize;
    let period = 2 * n;
    let mut i = index.rem_euclid(period);
    if i >= n {
        i = period - 1 - i;
    }
    i as usize
}

fn correlate_axis(input: ArrayView2<f64>, kernel: &Array1<f64>, axis: Axis) -> Array2<f64> {
    let radius = (kernel.len() / 2) as isize;
    let mut output = Array2::zeros(input.dim());
    for (src, mut dst) in input
        .lanes(axis)
        .into_iter()
        .zip(output.lanes_mut(axis))
    {
        let n = src.len();
        for (i, out) in dst.iter_mut().enumerate() {
            let mut acc = 0.0;
            for (k, &weight) in kernel.iter().enumerate() {
                let j = reflect_index(i as isize + k as isize - radius, n);
                acc += weight * src[j];
            }
            *out = acc;
        }
    }
    output
}

/// Isotropic Gaussian blur with reflected boundaries. `sigma <= 0` returns a copy.
pub fn gaussian_filter(image: ArrayView2<f64>, sigma: f64) -> Array2<f64> {
    if sigma <= 0.0 || image.is_empty() {
        return image.to_owned();
    }
    let kernel = gaussian_kernel_1d(sigma, GAUSSIAN_TRUNCATE);
    let rows_done = correlate_axis(image, &kernel, Axis(0));
    correlate_axis(rows_done.view(), &kernel, Axis(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn kernel_1d_is_normalized_and_truncated() {
        let kernel = gaussian_kernel_1d(2.0, GAUSSIAN_TRUNCATE);
        assert_eq!(kernel.len(), 17);
        assert_abs_diff_eq!(kernel.sum(), 1.0, epsilon = 1e-12);
        assert_eq!(gaussian_kernel_1d(0.1, GAUSSIAN_TRUNCATE).len(), 1);
    }

    #[test]
    fn vanishing_sigma_leaves_image_unchanged() {
        let mut image = Array2::<f64>::zeros((5, 5));
        image[[2, 3]] = 7.0;
        for sigma in [1e-3, 1e-160, 1e-200, f64::MIN_POSITIVE] {
            assert_eq!(gaussian_kernel_1d(sigma, GAUSSIAN_TRUNCATE).to_vec(), vec![1.0]);
            assert_eq!(gaussian_filter(image.view(), sigma), image);
        }
    }

    #[test]
    fn kernel_2d_has_odd_size_and_unit_sum() {
        let kernel = gaussian_kernel_2d(4.0);
        assert_eq!(kernel.dim(), (33, 33));
        assert_abs_diff_eq!(kernel.sum(), 1.0, epsilon = 1e-12);
        assert_eq!(kernel[[16, 16]], kernel.fold(0.0, |m: f64, &v| m.max(v)));
    }

    #[test]
    fn reflect_mirrors_edges() {
        assert_eq!(reflect_index(-1, 4), 0);
        assert_eq!(reflect_index(-2, 4), 1);
        assert_eq!(reflect_index(4, 4), 3);
        assert_eq!(reflect_index(9, 4), 1);
    }

    #[test]
    fn filter_preserves_constant_image() {
        let image = Array2::from_elem((7, 9), 3.5);
        let blurred = gaussian_filter(image.view(), 1.5);
        for value in blurred.iter() {
            assert_abs_diff_eq!(*value, 3.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn filter_spreads_impulse_and_conserves_flux() {
        let mut image = Array2::<f64>::zeros((21, 21));
        image[[10, 10]] = 1.0;
        let blurred = gaussian_filter(image.view(), 1.0);
        assert_abs_diff_eq!(blurred.sum(), 1.0, epsilon = 1e-12);
        assert!(blurred[[10, 11]] > 0.0);
        assert!(blurred[[10, 10]] < 1.0);
    }
}
