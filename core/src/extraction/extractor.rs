use log::debug;
use ndarray::ArrayView2;

use crate::extraction::labeling::{label_components, measure_object};
use crate::extraction::{
    Background, ExtractOptions, SegmentationMap, SegmentedCatalog, SourceCatalog, SourceExtractor,
};
use crate::math::fft::convolve_fft;
use crate::prelude::StageResult;

/// Threshold-and-label extractor backed by the mesh background model.
#[derive(Debug, Clone, Default)]
pub struct MeshExtractor;

impl MeshExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl SourceExtractor for MeshExtractor {
    fn estimate_background(
        &self,
        image: ArrayView2<f64>,
        mask: Option<ArrayView2<bool>>,
        box_width: usize,
        box_height: usize,
        filter_width: usize,
        filter_height: usize,
    ) -> StageResult<Background> {
        Background::estimate(image, mask, box_width, box_height, filter_width, filter_height)
    }

    fn extract(
        &self,
        image: ArrayView2<f64>,
        threshold: f64,
        filter_kernel: Option<ArrayView2<f64>>,
        options: &ExtractOptions,
    ) -> StageResult<SegmentedCatalog> {
        let shape = image.dim();
        let detected = match filter_kernel {
            Some(kernel) => convolve_fft(image, kernel, false)?.mapv(|v| v > threshold),
            None => image.mapv(|v| v > threshold),
        };

        let (mut labels, components) = label_components(detected.view(), options.connectivity);
        let total = components.len();

        let mut records = Vec::new();
        let mut relabel = vec![0u32; total + 1];
        for (index, pixels) in components.iter().enumerate() {
            if pixels.len() < options.min_area {
                continue;
            }
            records.push(measure_object(image, pixels));
            relabel[index + 1] = SourceCatalog::label_of(records.len() - 1);
        }
        labels.mapv_inplace(|label| relabel[label as usize]);

        debug!(
            "extraction above {:.4}: {} components, {} kept (min area {})",
            threshold,
            total,
            records.len(),
            options.min_area
        );

        SegmentedCatalog::new(
            SourceCatalog::new(records),
            SegmentationMap::new(labels),
            shape,
        )
    }
}
