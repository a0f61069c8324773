use log::debug;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::extraction::{
    Background, ExtractOptions, SegmentationMap, SourceCatalog, SourceExtractor,
};
use crate::math::filter::gaussian_kernel_2d;
use crate::prelude::{ensure_finite, ensure_shape, Image, StageError, StageResult};
use crate::processing::background::{measure_background, BackgroundConfig};

/// Detection settings. `threshold` is in units of the background's global RMS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub threshold: f64,
    pub background: BackgroundConfig,
    /// Sigma (pixels) of the Gaussian smoothing kernel; `None` or zero disables it.
    pub smoothing_sigma: Option<f64>,
    pub extract: ExtractOptions,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 1.5,
            background: BackgroundConfig::default(),
            smoothing_sigma: Some(5.0),
            extract: ExtractOptions::default(),
        }
    }
}

impl DetectionConfig {
    fn smoothing_kernel(&self) -> StageResult<Option<Image>> {
        match self.smoothing_sigma {
            None => Ok(None),
            Some(sigma) if sigma == 0.0 => Ok(None),
            Some(sigma) if sigma.is_finite() && sigma > 0.0 => Ok(Some(gaussian_kernel_2d(sigma))),
            Some(sigma) => Err(StageError::InvalidInput(format!(
                "smoothing sigma must be positive and finite, got {}",
                sigma
            ))),
        }
    }
}

/// Every product of one detection pass.
#[derive(Debug, Clone)]
pub struct SourceDetection {
    pub catalog: SourceCatalog,
    pub segmentation: SegmentationMap,
    pub background: Background,
    /// Background-subtracted copy of the input.
    pub subtracted: Image,
}

/// Estimates and removes the background, then extracts every object brighter than
/// `threshold · global_rms`.
pub fn detect_sources(
    extractor: &dyn SourceExtractor,
    image: ArrayView2<f64>,
    config: &DetectionConfig,
    mask: Option<ArrayView2<bool>>,
) -> StageResult<SourceDetection> {
    if let Some(mask) = mask.as_ref() {
        ensure_shape("detection mask", image.dim(), mask.dim())?;
    }
    let image = image.to_owned();
    ensure_finite("detection image", &image)?;
    let kernel = config.smoothing_kernel()?;

    let (background, subtracted) =
        measure_background(extractor, image.view(), &config.background, mask, true)?;
    let subtracted = subtracted.ok_or_else(|| {
        StageError::Internal("background subtraction produced no image".into())
    })?;

    let absolute = config.threshold * background.global_rms();
    let extracted = extractor.extract(
        subtracted.view(),
        absolute,
        kernel.as_ref().map(|k| k.view()),
        &config.extract,
    )?;
    debug!(
        "detected {} objects above {:.4} ({} x rms {:.4})",
        extracted.catalog.len(),
        absolute,
        config.threshold,
        background.global_rms()
    );

    Ok(SourceDetection {
        catalog: extracted.catalog,
        segmentation: extracted.segmentation,
        background,
        subtracted,
    })
}
