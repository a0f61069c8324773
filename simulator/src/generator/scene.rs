use std::f64::consts::PI;

use anyhow::{bail, Context};
use ndarray::{Array2, Zip};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal, StandardNormal};
use sbfcore::math::fft::convolve_fft;
use sbfcore::Image;
use serde::{Deserialize, Serialize};

use crate::generator::psf::gaussian_psf;

/// Configuration for generating a synthetic SBF scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// Side length of the square image.
    pub size: usize,
    pub seed: u64,
    pub sky: f64,
    /// Central surface brightness of the exponential galaxy profile.
    pub galaxy_amplitude: f64,
    pub galaxy_scale: f64,
    /// Fluctuation variance per unit of model flux.
    pub sbf_variance: f64,
    pub psf_sigma: f64,
    pub psf_size: usize,
    pub star_count: usize,
    pub star_flux: f64,
    /// Stars are placed no closer than this to the galaxy center.
    pub star_min_radius: f64,
    pub read_noise: f64,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            size: 256,
            seed: 0,
            sky: 50.0,
            galaxy_amplitude: 500.0,
            galaxy_scale: 12.0,
            sbf_variance: 4.0,
            psf_sigma: 1.5,
            psf_size: 15,
            star_count: 8,
            star_flux: 20_000.0,
            star_min_radius: 70.0,
            read_noise: 3.0,
        }
    }
}

impl SceneConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.psf_size >= self.size {
            bail!(
                "PSF stamp ({}) must be smaller than the scene ({})",
                self.psf_size,
                self.size
            );
        }
        if !(self.sky > 0.0 && self.galaxy_amplitude >= 0.0 && self.galaxy_scale > 0.0) {
            bail!("sky must be positive and the galaxy profile non-negative");
        }
        if !(self.sbf_variance >= 0.0 && self.read_noise >= 0.0) {
            bail!("variances must be non-negative");
        }
        if self.star_count > 0 && self.star_min_radius >= self.max_star_radius() {
            bail!(
                "no room for stars between radius {} and the image edge",
                self.star_min_radius
            );
        }
        Ok(())
    }

    fn max_star_radius(&self) -> f64 {
        self.size as f64 / 2.0 - self.psf_size as f64 / 2.0
    }
}

/// A synthetic observation and the pieces needed to measure it.
#[derive(Debug, Clone)]
pub struct Scene {
    pub image: Image,
    /// Smooth galaxy-plus-sky model.
    pub model: Image,
    pub psf: Image,
    /// `(image - model) / sqrt(model)`.
    pub residual: Image,
}

pub fn build_scene(config: &SceneConfig) -> anyhow::Result<Scene> {
    config.validate()?;
    let size = config.size;
    let center = size as f64 / 2.0;
    let mut rng = StdRng::seed_from_u64(config.seed);

    let psf = gaussian_psf(config.psf_size, config.psf_sigma)?;
    let model = Array2::from_shape_fn((size, size), |(row, col)| {
        let radius = (row as f64 - center).hypot(col as f64 - center);
        config.sky + config.galaxy_amplitude * (-radius / config.galaxy_scale).exp()
    });

    // unresolved stellar population: white fluctuations with variance proportional to flux
    let mut sources = model.mapv(|flux| {
        let draw: f64 = StandardNormal.sample(&mut rng);
        draw * (config.sbf_variance * flux).sqrt()
    });
    for _ in 0..config.star_count {
        let angle = rng.gen_range(0.0..2.0 * PI);
        let radius = rng.gen_range(config.star_min_radius..config.max_star_radius());
        let row = (center + radius * angle.sin()).round() as usize;
        let col = (center + radius * angle.cos()).round() as usize;
        sources[[row.min(size - 1), col.min(size - 1)]] += config.star_flux;
    }
    let blurred = convolve_fft(sources.view(), psf.view(), true)
        .context("convolving scene with the PSF")?;

    let read_noise =
        Normal::new(0.0, config.read_noise).context("building read-noise distribution")?;
    let mut image = &model + &blurred;
    image.mapv_inplace(|value| value + read_noise.sample(&mut rng));

    let mut residual = Array2::zeros((size, size));
    Zip::from(&mut residual)
        .and(&image)
        .and(&model)
        .for_each(|out, &observed, &smooth| *out = (observed - smooth) / smooth.sqrt());

    Ok(Scene {
        image,
        model,
        psf,
        residual,
    })
}
