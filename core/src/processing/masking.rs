//! Source masks around a target galaxy.
//!
//! Detected footprints are grown by Gaussian blurring of the segmentation map, catalog
//! objects are painted as scaled ellipses, and the union of both becomes the final mask.
//! Objects close to the galaxy are spared so that its own light is not masked.

use std::path::PathBuf;

use log::{debug, warn};
use ndarray::Zip;
use serde::{Deserialize, Serialize};

use crate::extraction::{
    EllipseShape, MeshExtractor, SegmentationMap, SourceCatalog, SourceExtractor,
};
use crate::io::{self, ImageSource};
use crate::math::filter::gaussian_filter;
use crate::prelude::{Mask, ProcessingStage, StageError, StageResult};
use crate::processing::background::BackgroundConfig;
use crate::processing::detection::{detect_sources, DetectionConfig};
use crate::telemetry::LogManager;

/// Blur-and-threshold growth of segmentation footprints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationGrowth {
    /// Gaussian sigma (pixels); zero keeps the footprint as is.
    pub grow_sigma: f64,
    /// Fraction of `ceiling` a blurred pixel must exceed to be masked.
    pub threshold: f64,
    /// Value given to every labeled pixel before blurring.
    pub ceiling: f64,
}

impl Default for SegmentationGrowth {
    fn default() -> Self {
        Self {
            grow_sigma: 6.0,
            threshold: 0.01,
            ceiling: 1000.0,
        }
    }
}

/// Grown mask of every labeled pixel in `segmentation`.
pub fn segmentation_mask(segmentation: &SegmentationMap, growth: &SegmentationGrowth) -> Mask {
    let ceiling = growth.ceiling;
    let lifted = segmentation
        .labels()
        .mapv(|label| if label > 0 { ceiling } else { 0.0 });
    let blurred = gaussian_filter(lifted.view(), growth.grow_sigma);
    let cut = ceiling * growth.threshold;
    blurred.mapv(|value| value > cut)
}

/// Paints every catalog object as its ellipse scaled by `growth_factor`.
pub fn object_mask(
    extractor: &dyn SourceExtractor,
    catalog: &SourceCatalog,
    shape: (usize, usize),
    growth_factor: f64,
) -> Mask {
    let mut mask = Mask::from_elem(shape, false);
    if catalog.is_empty() {
        warn!("object mask requested for an empty catalog; nothing to mask");
        return mask;
    }
    extractor.rasterize_ellipses(&mut mask, &catalog.shapes(), growth_factor);
    mask
}

/// One analytic ellipse for [`elliptical_mask`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EllipticalAperture {
    pub semi_major: f64,
    /// `1 - b/a`.
    #[serde(default)]
    pub ellipticity: f64,
    /// Counterclockwise from +x.
    #[serde(default)]
    pub rotation_degrees: f64,
    /// `(x, y)`; the geometric center of the mask when absent.
    #[serde(default)]
    pub center: Option<(f64, f64)>,
}

impl EllipticalAperture {
    pub fn circle(radius: f64) -> Self {
        Self {
            semi_major: radius,
            ellipticity: 0.0,
            rotation_degrees: 0.0,
            center: None,
        }
    }

    fn shape_in(&self, shape: (usize, usize)) -> StageResult<EllipseShape> {
        if !(self.semi_major.is_finite() && self.semi_major > 0.0) {
            return Err(StageError::InvalidInput(format!(
                "semi-major axis must be positive, got {}",
                self.semi_major
            )));
        }
        if !(0.0..1.0).contains(&self.ellipticity) {
            return Err(StageError::InvalidInput(format!(
                "ellipticity must lie in [0, 1), got {}",
                self.ellipticity
            )));
        }
        let (x, y) = self
            .center
            .unwrap_or((shape.1 as f64 / 2.0, shape.0 as f64 / 2.0));
        Ok(EllipseShape {
            x,
            y,
            a: self.semi_major,
            b: self.semi_major * (1.0 - self.ellipticity),
            theta: self.rotation_degrees.to_radians(),
        })
    }
}

/// Mask of the given apertures on a canvas of `shape`. Independent of detection.
pub fn elliptical_mask(shape: (usize, usize), apertures: &[EllipticalAperture]) -> StageResult<Mask> {
    let ellipses = apertures
        .iter()
        .map(|aperture| aperture.shape_in(shape))
        .collect::<StageResult<Vec<_>>>()?;
    let mut mask = Mask::from_elem(shape, false);
    crate::extraction::ellipse::mask_ellipses(&mut mask, &ellipses, 1.0);
    Ok(mask)
}

/// Pixel position of the target galaxy.
///
/// Written as the string `center` or as `{at: {x, y}}` in any serde format.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "PositionRepr", into = "PositionRepr")]
pub enum GalaxyPosition {
    /// Geometric center, `(cols / 2, rows / 2)`.
    Center,
    At { x: f64, y: f64 },
}

#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum NamedPosition {
    Center,
}

#[derive(Clone, Copy, Serialize, Deserialize)]
struct PixelPoint {
    x: f64,
    y: f64,
}

#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
enum PositionRepr {
    Named(NamedPosition),
    Explicit { at: PixelPoint },
}

impl From<PositionRepr> for GalaxyPosition {
    fn from(repr: PositionRepr) -> Self {
        match repr {
            PositionRepr::Named(NamedPosition::Center) => GalaxyPosition::Center,
            PositionRepr::Explicit { at } => GalaxyPosition::At { x: at.x, y: at.y },
        }
    }
}

impl From<GalaxyPosition> for PositionRepr {
    fn from(position: GalaxyPosition) -> Self {
        match position {
            GalaxyPosition::Center => PositionRepr::Named(NamedPosition::Center),
            GalaxyPosition::At { x, y } => PositionRepr::Explicit {
                at: PixelPoint { x, y },
            },
        }
    }
}

impl Default for GalaxyPosition {
    fn default() -> Self {
        GalaxyPosition::Center
    }
}

impl GalaxyPosition {
    pub fn resolve(&self, shape: (usize, usize)) -> StageResult<(f64, f64)> {
        match *self {
            GalaxyPosition::Center => Ok((shape.1 as f64 / 2.0, shape.0 as f64 / 2.0)),
            GalaxyPosition::At { x, y } if x.is_finite() && y.is_finite() => Ok((x, y)),
            GalaxyPosition::At { x, y } => Err(StageError::InvalidInput(format!(
                "galaxy position ({}, {}) is not finite",
                x, y
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GalaxyMaskConfig {
    pub detection: DetectionConfig,
    pub galaxy_position: GalaxyPosition,
    /// Objects within this radius keep their segmentation footprint out of the mask.
    pub seg_exclusion_radius: f64,
    /// Objects within this radius are left out of the ellipse mask.
    pub obj_exclusion_radius: f64,
    pub growth: SegmentationGrowth,
    pub obj_growth_factor: f64,
    /// Where to write the final mask, if anywhere.
    pub output_path: Option<PathBuf>,
}

impl Default for GalaxyMaskConfig {
    fn default() -> Self {
        Self {
            detection: DetectionConfig {
                threshold: 1.5,
                background: BackgroundConfig {
                    box_size: 110,
                    filter_frac_of_box: 0.5,
                },
                smoothing_sigma: Some(4.0),
                ..Default::default()
            },
            galaxy_position: GalaxyPosition::Center,
            seg_exclusion_radius: 100.0,
            obj_exclusion_radius: 15.0,
            growth: SegmentationGrowth {
                grow_sigma: 6.0,
                threshold: 0.02,
                ceiling: 1000.0,
            },
            obj_growth_factor: 3.0,
            output_path: None,
        }
    }
}

/// Detects sources in `source` and returns the combined mask (true = excluded).
pub fn build_galaxy_mask(
    extractor: &dyn SourceExtractor,
    source: &ImageSource,
    config: &GalaxyMaskConfig,
) -> StageResult<Mask> {
    let image = source.load()?;
    let shape = image.dim();
    let (gal_x, gal_y) = config.galaxy_position.resolve(shape)?;

    let detection = detect_sources(extractor, image.view(), &config.detection, None)?;
    let mut segmentation = detection.segmentation;

    let spared = detection
        .catalog
        .labels_within(gal_x, gal_y, config.seg_exclusion_radius);
    for &label in &spared {
        segmentation.clear_label(label)?;
    }
    let kept = detection
        .catalog
        .outside(gal_x, gal_y, config.obj_exclusion_radius);
    debug!(
        "galaxy at ({:.1}, {:.1}): {} detections, {} spared from segmentation, {} painted as ellipses",
        gal_x,
        gal_y,
        detection.catalog.len(),
        spared.len(),
        kept.len()
    );

    let mut mask = segmentation_mask(&segmentation, &config.growth);
    let objects = object_mask(extractor, &kept, shape, config.obj_growth_factor);
    Zip::from(&mut mask)
        .and(&objects)
        .for_each(|masked, &object| *masked |= object);

    if let Some(path) = config.output_path.as_ref() {
        io::write_mask(path, &mask)?;
    }
    Ok(mask)
}

/// Masking step for stage-driven pipelines.
pub struct MaskingStage {
    extractor: Box<dyn SourceExtractor>,
    config: Option<GalaxyMaskConfig>,
    logger: LogManager,
}

impl MaskingStage {
    pub fn new() -> Self {
        Self::with_extractor(Box::new(MeshExtractor::new()))
    }

    pub fn with_extractor(extractor: Box<dyn SourceExtractor>) -> Self {
        Self {
            extractor,
            config: None,
            logger: LogManager::new("masking"),
        }
    }
}

impl Default for MaskingStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingStage for MaskingStage {
    type Config = GalaxyMaskConfig;
    type Input = ImageSource;
    type Output = Mask;

    fn initialize(&mut self, config: &GalaxyMaskConfig) -> StageResult<()> {
        self.config = Some(config.clone());
        Ok(())
    }

    fn execute(&mut self, input: ImageSource) -> StageResult<Mask> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| StageError::Internal("masking stage not initialized".into()))?;
        let mask = build_galaxy_mask(self.extractor.as_ref(), &input, config)?;
        let masked = mask.iter().filter(|v| **v).count();
        self.logger.record(&format!(
            "masked {} of {} pixels ({:.2}%)",
            masked,
            mask.len(),
            100.0 * masked as f64 / mask.len().max(1) as f64
        ));
        Ok(mask)
    }

    fn cleanup(&mut self) {
        self.config = None;
    }
}
