//! Source-extraction collaborator: background estimation, object extraction with a
//! segmentation map, and ellipse rasterization.
//!
//! The pipeline only talks to the [`SourceExtractor`] trait. [`MeshExtractor`] is the
//! default implementation.

pub mod background;
pub mod ellipse;
pub mod extractor;
pub mod labeling;

pub use background::Background;
pub use ellipse::EllipseShape;
pub use extractor::MeshExtractor;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::prelude::{ensure_shape, Mask, StageError, StageResult};

/// Pixel adjacency used when grouping detected pixels into objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectivity {
    Four,
    Eight,
}

/// Extra knobs forwarded to the extraction primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractOptions {
    /// Objects with fewer pixels are discarded.
    pub min_area: usize,
    pub connectivity: Connectivity,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            min_area: 5,
            connectivity: Connectivity::Eight,
        }
    }
}

/// Position and shape of one detected object, in pixel coordinates (x = column).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub x: f64,
    pub y: f64,
    /// Semi-major axis (pixels).
    pub a: f64,
    /// Semi-minor axis (pixels).
    pub b: f64,
    /// Position angle in radians, counterclockwise from +x.
    pub theta: f64,
    pub flux: f64,
    pub peak: f64,
    pub npix: usize,
}

impl SourceRecord {
    pub fn shape(&self) -> EllipseShape {
        EllipseShape {
            x: self.x,
            y: self.y,
            a: self.a,
            b: self.b,
            theta: self.theta,
        }
    }

    pub fn distance_to(&self, x: f64, y: f64) -> f64 {
        (self.x - x).hypot(self.y - y)
    }
}

/// Ordered object records. The object at index `i` owns segmentation label `i + 1`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceCatalog {
    records: Vec<SourceRecord>,
}

impl SourceCatalog {
    pub fn new(records: Vec<SourceRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[SourceRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceRecord> {
        self.records.iter()
    }

    /// Segmentation label owned by the record at `index`.
    pub fn label_of(index: usize) -> u32 {
        index as u32 + 1
    }

    /// Labels of every record within `radius` of `(x, y)` (inclusive).
    pub fn labels_within(&self, x: f64, y: f64, radius: f64) -> Vec<u32> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, record)| record.distance_to(x, y) <= radius)
            .map(|(index, _)| Self::label_of(index))
            .collect()
    }

    /// New catalog holding only records strictly farther than `radius` from `(x, y)`.
    ///
    /// The result no longer lines up with any segmentation map.
    pub fn outside(&self, x: f64, y: f64, radius: f64) -> SourceCatalog {
        SourceCatalog::new(
            self.records
                .iter()
                .copied()
                .filter(|record| record.distance_to(x, y) > radius)
                .collect(),
        )
    }

    pub fn shapes(&self) -> Vec<EllipseShape> {
        self.records.iter().map(SourceRecord::shape).collect()
    }
}

/// Label image; 0 is background, positive values name the owning object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationMap {
    labels: Array2<u32>,
}

impl SegmentationMap {
    pub fn new(labels: Array2<u32>) -> Self {
        Self { labels }
    }

    pub fn labels(&self) -> &Array2<u32> {
        &self.labels
    }

    pub fn dim(&self) -> (usize, usize) {
        self.labels.dim()
    }

    /// Zeroes every pixel carrying `label`; returns how many pixels changed.
    pub fn clear_label(&mut self, label: u32) -> StageResult<usize> {
        if label == 0 {
            return Err(StageError::InvalidInput(
                "label 0 is reserved for background and cannot be excluded".into(),
            ));
        }
        let mut cleared = 0;
        self.labels.mapv_inplace(|value| {
            if value == label {
                cleared += 1;
                0
            } else {
                value
            }
        });
        Ok(cleared)
    }

    /// Pixels owned by any object.
    pub fn footprint(&self) -> Mask {
        self.labels.mapv(|value| value > 0)
    }
}

/// Catalog and segmentation map produced together by one extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentedCatalog {
    pub catalog: SourceCatalog,
    pub segmentation: SegmentationMap,
}

impl SegmentedCatalog {
    /// Validates the pairing: matching shape and labels present exactly `1..=len`.
    pub fn new(
        catalog: SourceCatalog,
        segmentation: SegmentationMap,
        image_shape: (usize, usize),
    ) -> StageResult<Self> {
        ensure_shape("segmentation map", image_shape, segmentation.dim())?;

        let mut seen = vec![false; catalog.len()];
        for &label in segmentation.labels().iter() {
            if label == 0 {
                continue;
            }
            let index = label as usize - 1;
            match seen.get_mut(index) {
                Some(flag) => *flag = true,
                None => {
                    return Err(StageError::InvalidInput(format!(
                        "segmentation label {} has no catalog entry (catalog holds {})",
                        label,
                        catalog.len()
                    )))
                }
            }
        }
        if let Some(missing) = seen.iter().position(|flag| !flag) {
            return Err(StageError::InvalidInput(format!(
                "catalog entry {} has no pixels under label {}",
                missing,
                SourceCatalog::label_of(missing)
            )));
        }

        Ok(Self {
            catalog,
            segmentation,
        })
    }
}

/// Background-estimation and extraction capability consumed by the masking pipeline.
pub trait SourceExtractor {
    /// Fits a smooth background using `box_width × box_height` boxes and a median filter
    /// spanning `filter_width × filter_height` boxes. Masked pixels are ignored.
    fn estimate_background(
        &self,
        image: ArrayView2<f64>,
        mask: Option<ArrayView2<bool>>,
        box_width: usize,
        box_height: usize,
        filter_width: usize,
        filter_height: usize,
    ) -> StageResult<Background>;

    /// Extracts objects from a background-subtracted image above an absolute threshold.
    fn extract(
        &self,
        image: ArrayView2<f64>,
        threshold: f64,
        filter_kernel: Option<ArrayView2<f64>>,
        options: &ExtractOptions,
    ) -> StageResult<SegmentedCatalog>;

    /// Sets every pixel inside each ellipse scaled by `scale`.
    fn rasterize_ellipses(&self, canvas: &mut Mask, ellipses: &[EllipseShape], scale: f64) {
        ellipse::mask_ellipses(canvas, ellipses, scale);
    }
}
