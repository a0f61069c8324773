use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::math::interp::LinearInterpolator;
use crate::prelude::{Image, StageError, StageResult};

/// Fit function, stored as data so that a deserialized result can still be evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FitModel {
    /// `psf(k) · p0 + p1`, with `psf` linearly interpolated over the retained knots.
    LinearPsfPlusConstant { k: Vec<f64>, psf: Vec<f64> },
}

impl FitModel {
    pub fn param_count(&self) -> usize {
        match self {
            FitModel::LinearPsfPlusConstant { .. } => 2,
        }
    }

    /// Validated, ready-to-call form of the model.
    pub fn function(&self) -> StageResult<FitFunction> {
        match self {
            FitModel::LinearPsfPlusConstant { k, psf } => Ok(FitFunction {
                psf: LinearInterpolator::new(k.clone(), psf.clone())?,
            }),
        }
    }

    pub fn evaluate(&self, k: f64, params: &[f64]) -> StageResult<f64> {
        self.function()?.eval(k, params)
    }
}

/// Evaluator built from a [`FitModel`].
#[derive(Debug, Clone)]
pub struct FitFunction {
    psf: LinearInterpolator,
}

impl FitFunction {
    pub fn eval(&self, k: f64, params: &[f64]) -> StageResult<f64> {
        match params {
            [amplitude, floor] => Ok(self.psf.eval(k)? * amplitude + floor),
            _ => Err(StageError::InvalidInput(format!(
                "fit function takes 2 parameters, got {}",
                params.len()
            ))),
        }
    }
}

/// Everything produced by one SBF measurement. Read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SbfResult {
    ps_2d_image: Image,
    ps_2d_psf: Image,
    ps_image: Vec<f64>,
    ps_image_err: Vec<f64>,
    ps_psf: Vec<f64>,
    npix: usize,
    k: Vec<f64>,
    params: Vec<f64>,
    covariance: Array2<f64>,
    chi2: f64,
    model: FitModel,
}

pub(crate) struct SbfParts {
    pub ps_2d_image: Image,
    pub ps_2d_psf: Image,
    pub ps_image: Vec<f64>,
    pub ps_image_err: Vec<f64>,
    pub ps_psf: Vec<f64>,
    pub npix: usize,
    pub k: Vec<f64>,
    pub params: Vec<f64>,
    pub covariance: Array2<f64>,
    pub chi2: f64,
    pub model: FitModel,
}

impl SbfResult {
    pub(crate) fn from_parts(parts: SbfParts) -> Self {
        Self {
            ps_2d_image: parts.ps_2d_image,
            ps_2d_psf: parts.ps_2d_psf,
            ps_image: parts.ps_image,
            ps_image_err: parts.ps_image_err,
            ps_psf: parts.ps_psf,
            npix: parts.npix,
            k: parts.k,
            params: parts.params,
            covariance: parts.covariance,
            chi2: parts.chi2,
            model: parts.model,
        }
    }

    /// Full 2D power spectrum of the (masked) residual image.
    pub fn ps_2d_image(&self) -> &Image {
        &self.ps_2d_image
    }

    /// Full 2D PSF power spectrum, mask-corrected when a mask was used.
    pub fn ps_2d_psf(&self) -> &Image {
        &self.ps_2d_psf
    }

    pub fn ps_image(&self) -> &[f64] {
        &self.ps_image
    }

    pub fn ps_image_err(&self) -> &[f64] {
        &self.ps_image_err
    }

    pub fn ps_psf(&self) -> &[f64] {
        &self.ps_psf
    }

    pub fn npix(&self) -> usize {
        self.npix
    }

    /// Retained wavenumbers (cycles/pixel).
    pub fn k(&self) -> &[f64] {
        &self.k
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    pub fn chi2(&self) -> f64 {
        self.chi2
    }

    pub fn model(&self) -> &FitModel {
        &self.model
    }

    /// SBF amplitude `p0`.
    pub fn amplitude(&self) -> f64 {
        self.params[0]
    }

    /// White-noise floor `p1`.
    pub fn noise_floor(&self) -> f64 {
        self.params[1]
    }

    pub fn amplitude_error(&self) -> f64 {
        self.covariance[[0, 0]].sqrt()
    }

    /// Fitted model at `k` using the stored parameters.
    pub fn evaluate(&self, k: f64) -> StageResult<f64> {
        self.model.evaluate(k, &self.params)
    }

    /// Fitted model at every retained wavenumber.
    pub fn model_profile(&self) -> StageResult<Vec<f64>> {
        let function = self.model.function()?;
        self.k.iter().map(|&k| function.eval(k, &self.params)).collect()
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> StageResult<()> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn from_reader<R: Read>(reader: R) -> StageResult<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Writes the result to `path`, replacing any existing file.
    pub fn to_file(&self, path: &Path) -> StageResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.to_writer(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn from_file(path: &Path) -> StageResult<Self> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }
}
