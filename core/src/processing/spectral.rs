//! Power spectra, azimuthal averages and the wavenumber grid that goes with them.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::math::fft::{fftfreq_shifted, fftshift, FftHelper};
use crate::prelude::{ensure_finite, StageError, StageResult};

/// Mean and standard error per radial bin, bin 1 first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadialProfile {
    pub mean: Vec<f64>,
    pub stderr: Vec<f64>,
}

impl RadialProfile {
    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }
}

/// Squared magnitude of the centered 2D DFT of `data`.
pub fn power_spectrum(data: ArrayView2<f64>) -> StageResult<Array2<f64>> {
    let (rows, cols) = data.dim();
    if rows == 0 || cols == 0 {
        return Err(StageError::InvalidInput(
            "power spectrum of an empty array".into(),
        ));
    }
    let owned = data.to_owned();
    ensure_finite("power spectrum input", &owned)?;

    let transformed = FftHelper::new(rows, cols).forward_real(owned.view())?;
    Ok(fftshift(&transformed).mapv(|value| value.norm_sqr()))
}

/// Averages `image` over `num_radial_bins` annuli around the geometric center
/// `(rows / 2, cols / 2)` (half-pixel for odd sizes).
///
/// Pixel radii are scaled so the farthest pixel lands on bin `num_radial_bins`; bin 0
/// (the innermost annulus) is not reported. Standard errors are `std / sqrt(count)` with
/// the population standard deviation. A reported bin without pixels is an error.
pub fn azimuthal_average(image: ArrayView2<f64>, num_radial_bins: usize) -> StageResult<RadialProfile> {
    let (rows, cols) = image.dim();
    if num_radial_bins == 0 {
        return Err(StageError::InvalidInput(
            "azimuthal average needs at least one radial bin".into(),
        ));
    }
    let center_y = rows as f64 / 2.0;
    let center_x = cols as f64 / 2.0;
    let radius = |r: usize, c: usize| (c as f64 - center_x).hypot(r as f64 - center_y);

    let r_max = image
        .indexed_iter()
        .map(|((r, c), _)| radius(r, c))
        .fold(0.0, f64::max);
    if !(r_max > 0.0) {
        return Err(StageError::InvalidInput(format!(
            "azimuthal average needs more than one pixel, got {}x{}",
            rows, cols
        )));
    }

    let mut count = vec![0usize; num_radial_bins + 1];
    let mut sum = vec![0.0; num_radial_bins + 1];
    let mut bins = Array2::<usize>::zeros((rows, cols));
    for ((r, c), &value) in image.indexed_iter() {
        let bin = ((num_radial_bins as f64 * radius(r, c) / r_max).floor() as usize)
            .min(num_radial_bins);
        bins[[r, c]] = bin;
        count[bin] += 1;
        sum[bin] += value;
    }

    let max_bin = count.iter().rposition(|&n| n > 0).unwrap_or(0);
    if let Some(empty) = (1..=max_bin).find(|&bin| count[bin] == 0) {
        return Err(StageError::DegenerateBin {
            bin: empty,
            num_bins: num_radial_bins,
        });
    }

    let means: Vec<f64> = (0..=max_bin)
        .map(|bin| sum[bin] / count[bin].max(1) as f64)
        .collect();
    let mut squares = vec![0.0; max_bin + 1];
    for (&bin, &value) in bins.iter().zip(image.iter()) {
        let delta = value - means[bin];
        squares[bin] += delta * delta;
    }

    let mean = means[1..].to_vec();
    let stderr = (1..=max_bin)
        .map(|bin| {
            let n = count[bin] as f64;
            (squares[bin] / n).sqrt() / n.sqrt()
        })
        .collect();
    Ok(RadialProfile { mean, stderr })
}

/// Azimuthally averaged `|k|` (cycles/pixel) for a square window of side `window_length`.
pub fn k_values(window_length: usize, num_radial_bins: usize) -> StageResult<Vec<f64>> {
    let freq = fftfreq_shifted(window_length);
    let grid = Array2::from_shape_fn((window_length, window_length), |(r, c)| {
        freq[c].hypot(freq[r])
    });
    Ok(azimuthal_average(grid.view(), num_radial_bins)?.mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn centered_gaussian(n: usize, sigma: f64) -> Array2<f64> {
        let center = (n / 2) as f64;
        Array2::from_shape_fn((n, n), |(r, c)| {
            let dx = c as f64 - center;
            let dy = r as f64 - center;
            (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
        })
    }

    #[test]
    fn constant_image_peaks_at_zero_frequency() {
        let image = Array2::from_elem((16, 16), 2.0);
        let ps = power_spectrum(image.view()).unwrap();
        assert!(ps.iter().all(|&v| v >= 0.0));
        assert_abs_diff_eq!(ps[[8, 8]], (2.0 * 256.0f64).powi(2), epsilon = 1e-6);
        let others: f64 = ps.sum() - ps[[8, 8]];
        assert_abs_diff_eq!(others, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn power_spectrum_satisfies_parseval() {
        let image = Array2::from_shape_fn((12, 10), |(r, c)| ((r * 7 + c * 3) % 5) as f64 - 2.0);
        let ps = power_spectrum(image.view()).unwrap();
        let energy: f64 = image.iter().map(|v| v * v).sum();
        assert_abs_diff_eq!(ps.sum() / 120.0, energy, epsilon = 1e-9);
    }

    #[test]
    fn non_finite_input_is_rejected() {
        let mut image = Array2::<f64>::zeros((4, 4));
        image[[1, 2]] = f64::NAN;
        assert!(matches!(
            power_spectrum(image.view()),
            Err(StageError::InvalidInput(_))
        ));
    }

    #[test]
    fn symmetric_profile_is_non_increasing() {
        let image = centered_gaussian(64, 6.0);
        let profile = azimuthal_average(image.view(), 20).unwrap();
        assert_eq!(profile.len(), 20);
        for pair in profile.mean.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-12);
        }
    }

    #[test]
    fn stderr_shrinks_with_pixel_count() {
        // alternating +-1 pattern: every annulus has std close to 1
        let image = Array2::from_shape_fn((64, 64), |(r, c)| if (r + c) % 2 == 0 { 1.0 } else { -1.0 });
        let profile = azimuthal_average(image.view(), 16).unwrap();
        assert!(profile.stderr[8] < profile.stderr[1]);
    }

    #[test]
    fn too_many_bins_is_degenerate() {
        let image = Array2::from_elem((6, 6), 1.0);
        assert!(matches!(
            azimuthal_average(image.view(), 200),
            Err(StageError::DegenerateBin { .. })
        ));
    }

    #[test]
    fn single_pixel_cannot_fill_inner_bins() {
        let image = Array2::from_elem((1, 1), 1.0);
        assert!(azimuthal_average(image.view(), 4).is_err());
    }

    #[test]
    fn k_values_increase_and_stay_below_nyquist_diagonal() {
        let k = k_values(64, 45).unwrap();
        assert_eq!(k.len(), 45);
        for pair in k.windows(2) {
            assert!(pair[1] > pair[0]);
        }
        assert!(k[0] > 0.0);
        assert!(*k.last().unwrap() <= 0.5 * 2f64.sqrt() + 1e-12);
    }
}
