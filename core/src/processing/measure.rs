//! SBF fit engine.
//!
//! The azimuthally averaged power spectrum of a normalized residual image is modelled as
//! `psf(k) · p0 + p1`: the PSF power spectrum scaled by the fluctuation amplitude plus a
//! white-noise floor. When a mask is used, the PSF power spectrum is convolved with the
//! mask's own power spectrum so both profiles carry the same window.

use log::debug;
use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::math::fft::convolve_fft;
use crate::math::lm::{CurveFitOptions, CurveFitter, LevenbergMarquardt};
use crate::prelude::{
    ensure_finite, ensure_shape, Image, Mask, ProcessingStage, StageError, StageResult,
};
use crate::processing::result::{FitModel, SbfParts, SbfResult};
use crate::processing::spectral::{azimuthal_average, k_values, power_spectrum};
use crate::telemetry::LogManager;

/// Fewest retained radial bins a fit accepts.
const MIN_FIT_BINS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasureConfig {
    /// Inclusive wavenumber window `[low, high]` in cycles/pixel.
    pub k_range: (f64, f64),
    /// Starting `[p0, p1]`.
    pub fit_param_guess: Vec<f64>,
    pub num_radial_bins: usize,
    /// Weight the fit by the radial standard errors of the image profile.
    pub use_sigma: bool,
    pub solver: CurveFitOptions,
}

impl Default for MeasureConfig {
    fn default() -> Self {
        Self {
            k_range: (0.01, 0.4),
            fit_param_guess: vec![100.0, 50.0],
            num_radial_bins: 45,
            use_sigma: false,
            solver: CurveFitOptions::default(),
        }
    }
}

impl MeasureConfig {
    fn validate(&self) -> StageResult<()> {
        let (low, high) = self.k_range;
        if !(low.is_finite() && high.is_finite() && low <= high) {
            return Err(StageError::InvalidInput(format!(
                "wavenumber range [{}, {}] is not an ordered finite interval",
                low, high
            )));
        }
        if self.num_radial_bins == 0 {
            return Err(StageError::InvalidInput("need at least one radial bin".into()));
        }
        if self.fit_param_guess.len() != 2 || self.fit_param_guess.iter().any(|p| !p.is_finite()) {
            return Err(StageError::InvalidInput(format!(
                "initial guess must be two finite values, got {:?}",
                self.fit_param_guess
            )));
        }
        Ok(())
    }
}

/// Zero-pads `psf` to `shape` and scales it to unit sum.
///
/// Per axis, `⌊(N - n) / 2⌋` zeros go before the data and the remainder after.
pub fn pad_psf(psf: ArrayView2<f64>, shape: (usize, usize)) -> StageResult<Image> {
    let (rows, cols) = psf.dim();
    if rows == 0 || cols == 0 {
        return Err(StageError::InvalidInput("PSF is empty".into()));
    }
    if rows > shape.0 || cols > shape.1 {
        return Err(StageError::shape("PSF larger than image", shape, (rows, cols)));
    }
    let total = psf.sum();
    if !(total.is_finite() && total != 0.0) {
        return Err(StageError::InvalidInput(format!(
            "PSF must have a finite non-zero sum, got {}",
            total
        )));
    }

    let top = (shape.0 - rows) / 2;
    let left = (shape.1 - cols) / 2;
    let mut padded = Array2::zeros(shape);
    padded
        .slice_mut(s![top..top + rows, left..left + cols])
        .zip_mut_with(&psf, |dst, &value| *dst = value / total);
    Ok(padded)
}

/// Measures SBF with the default Levenberg-Marquardt solver.
pub fn measure(
    residual: ArrayView2<f64>,
    psf: ArrayView2<f64>,
    mask: Option<ArrayView2<bool>>,
    config: &MeasureConfig,
) -> StageResult<SbfResult> {
    let solver = LevenbergMarquardt::new(config.solver.clone());
    measure_with(&solver, residual, psf, mask, config)
}

/// Measures SBF in a square normalized residual image.
///
/// Neither `residual`, `psf` nor `mask` is modified. A mask that excludes no pixel is
/// treated exactly like no mask.
pub fn measure_with(
    fitter: &dyn CurveFitter,
    residual: ArrayView2<f64>,
    psf: ArrayView2<f64>,
    mask: Option<ArrayView2<bool>>,
    config: &MeasureConfig,
) -> StageResult<SbfResult> {
    config.validate()?;
    let shape = residual.dim();
    if shape.0 != shape.1 {
        return Err(StageError::shape(
            "residual image must be square",
            (shape.0, shape.0),
            shape,
        ));
    }
    if shape.0 < 2 {
        return Err(StageError::InvalidInput(format!(
            "residual image {:?} is too small",
            shape
        )));
    }
    if let Some(mask) = mask.as_ref() {
        ensure_shape("residual mask", shape, mask.dim())?;
    }
    let mut image = residual.to_owned();
    ensure_finite("residual image", &image)?;
    let psf = psf.to_owned();
    ensure_finite("psf", &psf)?;

    let padded_psf = pad_psf(psf.view(), shape)?;
    let ps_psf_raw = power_spectrum(padded_psf.view())?;

    let excluding = mask.filter(|mask| mask.iter().any(|&excluded| excluded));
    let (npix, ps_2d_psf) = match excluding {
        Some(mask) => {
            image.zip_mut_with(&mask, |value, &excluded| {
                if excluded {
                    *value = 0.0;
                }
            });
            let weight = mask.mapv(|excluded| if excluded { 0.0 } else { 1.0 });
            let npix = mask.iter().filter(|excluded| !**excluded).count();
            if npix == 0 {
                return Err(StageError::InvalidInput("mask excludes every pixel".into()));
            }
            let ps_mask = power_spectrum(weight.view())?;
            (npix, convolve_fft(ps_psf_raw.view(), ps_mask.view(), true)?)
        }
        None => (shape.0 * shape.1, ps_psf_raw),
    };

    let ps_2d_image = power_spectrum(image.view())?;
    let image_profile = azimuthal_average(ps_2d_image.view(), config.num_radial_bins)?;
    let psf_profile = azimuthal_average(ps_2d_psf.view(), config.num_radial_bins)?;
    let wavenumbers = k_values(shape.0, config.num_radial_bins)?;
    if image_profile.len() != wavenumbers.len() || psf_profile.len() != wavenumbers.len() {
        return Err(StageError::Internal(format!(
            "radial profiles disagree: image {}, psf {}, k {}",
            image_profile.len(),
            psf_profile.len(),
            wavenumbers.len()
        )));
    }

    let (low, high) = config.k_range;
    let keep: Vec<usize> = wavenumbers
        .iter()
        .enumerate()
        .filter(|(_, &k)| k >= low && k <= high)
        .map(|(index, _)| index)
        .collect();
    if keep.len() < MIN_FIT_BINS {
        return Err(StageError::InvalidInput(format!(
            "wavenumber range [{}, {}] keeps {} radial bins, need at least {}",
            low,
            high,
            keep.len(),
            MIN_FIT_BINS
        )));
    }
    let pick = |values: &[f64]| -> Vec<f64> { keep.iter().map(|&i| values[i]).collect() };
    let k = pick(&wavenumbers);
    let ps_image = pick(&image_profile.mean);
    let ps_image_err = pick(&image_profile.stderr);
    let ps_psf = pick(&psf_profile.mean);
    debug!(
        "fitting {} of {} radial bins in k [{:.3}, {:.3}], npix {}",
        k.len(),
        wavenumbers.len(),
        low,
        high,
        npix
    );

    let model = FitModel::LinearPsfPlusConstant {
        k: k.clone(),
        psf: ps_psf.clone(),
    };
    let function = model.function()?;
    let sigma = if config.use_sigma {
        Some(ps_image_err.as_slice())
    } else {
        None
    };
    let fit = fitter.curve_fit(
        &|k: f64, params: &[f64]| function.eval(k, params),
        &k,
        &ps_image,
        &config.fit_param_guess,
        sigma,
    )?;
    debug!(
        "SBF fit: p0 {:.6e}, p1 {:.6e}, chi2 {:.4e} after {} iterations",
        fit.params[0], fit.params[1], fit.chi2, fit.iterations
    );

    Ok(SbfResult::from_parts(SbfParts {
        ps_2d_image,
        ps_2d_psf,
        ps_image,
        ps_image_err,
        ps_psf,
        npix,
        k,
        params: fit.params,
        covariance: fit.covariance,
        chi2: fit.chi2,
        model,
    }))
}

/// Inputs of one fit.
#[derive(Debug, Clone)]
pub struct FitInput {
    pub residual: Image,
    pub psf: Image,
    pub mask: Option<Mask>,
}

/// Measurement step for stage-driven pipelines.
pub struct FitStage {
    config: Option<MeasureConfig>,
    logger: LogManager,
}

impl FitStage {
    pub fn new() -> Self {
        Self {
            config: None,
            logger: LogManager::new("fit"),
        }
    }
}

impl Default for FitStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingStage for FitStage {
    type Config = MeasureConfig;
    type Input = FitInput;
    type Output = SbfResult;

    fn initialize(&mut self, config: &MeasureConfig) -> StageResult<()> {
        config.validate()?;
        self.config = Some(config.clone());
        Ok(())
    }

    fn execute(&mut self, input: FitInput) -> StageResult<SbfResult> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| StageError::Internal("fit stage not initialized".into()))?;
        let result = measure(
            input.residual.view(),
            input.psf.view(),
            input.mask.as_ref().map(|mask| mask.view()),
            config,
        )?;
        self.logger.record(&format!(
            "SBF amplitude {:.4e} ± {:.2e}, noise floor {:.4e}, npix {}",
            result.amplitude(),
            result.amplitude_error(),
            result.noise_floor(),
            result.npix()
        ));
        Ok(result)
    }

    fn cleanup(&mut self) {
        self.config = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::masking::{elliptical_mask, EllipticalAperture};
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    const PSF_SIGMA: f64 = 2.0;

    fn gaussian_psf(size: usize, sigma: f64) -> Image {
        let center = (size / 2) as f64;
        Array2::from_shape_fn((size, size), |(r, c)| {
            let dx = c as f64 - center;
            let dy = r as f64 - center;
            (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
        })
    }

    /// Unit-variance white field seen through the PSF, plus white noise of `sigma_n`.
    fn synthetic_residual(n: usize, sigma_n: f64, seed: u64) -> Image {
        let pad = 16;
        let big = n + 2 * pad;
        let mut rng = StdRng::seed_from_u64(seed);
        let white = Normal::new(0.0, 1.0).unwrap();
        let field = Array2::from_shape_fn((big, big), |_| white.sample(&mut rng));
        let psf = gaussian_psf(25, PSF_SIGMA);
        let smooth = convolve_fft(field.view(), psf.view(), true).unwrap();
        let noise = Normal::new(0.0, sigma_n).unwrap();
        let mut residual = smooth.slice(s![pad..pad + n, pad..pad + n]).to_owned();
        residual.mapv_inplace(|v| v + noise.sample(&mut rng));
        residual
    }

    #[test]
    fn pad_psf_centers_and_normalizes() {
        let psf = Array2::from_elem((3, 3), 2.0);
        let padded = pad_psf(psf.view(), (8, 8)).unwrap();
        assert_abs_diff_eq!(padded.sum(), 1.0, epsilon = 1e-12);
        // 5 spare rows: 2 before, 3 after
        assert_eq!(padded[[1, 3]], 0.0);
        assert!(padded[[2, 2]] > 0.0);
        assert!(padded[[4, 4]] > 0.0);
        assert_eq!(padded[[5, 4]], 0.0);
    }

    #[test]
    fn pad_psf_rejects_oversized_or_empty_psf() {
        let psf = Array2::from_elem((9, 4), 1.0);
        assert!(matches!(
            pad_psf(psf.view(), (8, 8)),
            Err(StageError::ShapeMismatch { .. })
        ));
        let zero = Array2::<f64>::zeros((3, 3));
        assert!(matches!(
            pad_psf(zero.view(), (8, 8)),
            Err(StageError::InvalidInput(_))
        ));
    }

    #[test]
    fn recovers_fluctuation_amplitude_and_noise_floor() {
        let n = 256;
        let residual = synthetic_residual(n, 0.5, 42);
        let psf = gaussian_psf(25, PSF_SIGMA);
        let result = measure(residual.view(), psf.view(), None, &MeasureConfig::default()).unwrap();

        let npix = (n * n) as f64;
        assert_eq!(result.npix(), n * n);
        assert_abs_diff_eq!(result.amplitude() / npix, 1.0, epsilon = 0.25);
        assert_abs_diff_eq!(result.noise_floor() / npix, 0.25, epsilon = 0.04);
        assert!(result.k().iter().all(|&k| (0.01..=0.4).contains(&k)));
        assert_eq!(result.k().len(), result.ps_image().len());
        assert_eq!(result.ps_psf().len(), result.ps_image_err().len());
        assert_eq!(result.ps_2d_image().dim(), (n, n));
    }

    #[test]
    fn mask_correction_keeps_per_pixel_amplitude() {
        let n = 256;
        let residual = synthetic_residual(n, 0.5, 9);
        let psf = gaussian_psf(25, PSF_SIGMA);
        let aperture = EllipticalAperture {
            center: Some((60.0, 180.0)),
            ..EllipticalAperture::circle(40.0)
        };
        let mask = elliptical_mask((n, n), &[aperture]).unwrap();
        let result = measure(
            residual.view(),
            psf.view(),
            Some(mask.view()),
            &MeasureConfig::default(),
        )
        .unwrap();

        let npix = result.npix() as f64;
        assert_eq!(result.npix(), mask.iter().filter(|m| !**m).count());
        assert!(result.npix() < n * n);
        assert_abs_diff_eq!(result.amplitude() / npix, 1.0, epsilon = 0.3);
        assert_abs_diff_eq!(result.noise_floor() / npix, 0.25, epsilon = 0.06);
    }

    #[test]
    fn empty_mask_matches_unmasked_measurement() {
        let residual = synthetic_residual(64, 0.5, 3);
        let psf = gaussian_psf(15, PSF_SIGMA);
        let clear = Mask::from_elem((64, 64), false);
        let config = MeasureConfig::default();

        let without = measure(residual.view(), psf.view(), None, &config).unwrap();
        let with = measure(residual.view(), psf.view(), Some(clear.view()), &config).unwrap();
        assert_eq!(with, without);
    }

    #[test]
    fn inputs_are_left_untouched() {
        let residual = synthetic_residual(64, 0.5, 4);
        let before = residual.clone();
        let psf = gaussian_psf(15, PSF_SIGMA);
        let mut mask = Mask::from_elem((64, 64), false);
        mask[[10, 10]] = true;
        measure(residual.view(), psf.view(), Some(mask.view()), &MeasureConfig::default()).unwrap();
        assert_eq!(residual, before);
    }

    #[test]
    fn sigma_weighting_runs() {
        let residual = synthetic_residual(64, 0.5, 5);
        let psf = gaussian_psf(15, PSF_SIGMA);
        let config = MeasureConfig {
            use_sigma: true,
            ..Default::default()
        };
        let result = measure(residual.view(), psf.view(), None, &config).unwrap();
        assert!(result.amplitude().is_finite());
        assert!(result.covariance().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn shape_errors_are_reported() {
        let psf = gaussian_psf(5, 1.0);
        let wide = Array2::<f64>::zeros((32, 48));
        assert!(matches!(
            measure(wide.view(), psf.view(), None, &MeasureConfig::default()),
            Err(StageError::ShapeMismatch { .. })
        ));

        let square = synthetic_residual(32, 0.5, 1);
        let mask = Mask::from_elem((32, 31), false);
        assert!(matches!(
            measure(square.view(), psf.view(), Some(mask.view()), &MeasureConfig::default()),
            Err(StageError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn narrow_wavenumber_window_is_rejected() {
        let residual = synthetic_residual(64, 0.5, 6);
        let psf = gaussian_psf(15, PSF_SIGMA);
        let config = MeasureConfig {
            k_range: (0.2, 0.201),
            ..Default::default()
        };
        assert!(matches!(
            measure(residual.view(), psf.view(), None, &config),
            Err(StageError::InvalidInput(_))
        ));
    }

    #[test]
    fn fully_masked_image_is_rejected() {
        let residual = synthetic_residual(32, 0.5, 2);
        let psf = gaussian_psf(5, 1.0);
        let mask = Mask::from_elem((32, 32), true);
        assert!(matches!(
            measure(residual.view(), psf.view(), Some(mask.view()), &MeasureConfig::default()),
            Err(StageError::InvalidInput(_))
        ));
    }

    #[test]
    fn solver_failure_surfaces_as_convergence_error() {
        let residual = synthetic_residual(64, 0.5, 8);
        let psf = gaussian_psf(15, PSF_SIGMA);
        let config = MeasureConfig {
            solver: CurveFitOptions {
                max_iterations: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            measure(residual.view(), psf.view(), None, &config),
            Err(StageError::FitConvergence { iterations: 0, .. })
        ));
    }

    #[test]
    fn stage_runs_after_initialization() {
        let mut stage = FitStage::new();
        let input = FitInput {
            residual: synthetic_residual(64, 0.5, 12),
            psf: gaussian_psf(15, PSF_SIGMA),
            mask: None,
        };
        assert!(matches!(
            stage.execute(input.clone()),
            Err(StageError::Internal(_))
        ));
        stage.initialize(&MeasureConfig::default()).unwrap();
        let result = stage.execute(input).unwrap();
        assert_eq!(result.npix(), 64 * 64);
        stage.cleanup();
    }
}
