//! Spectral utilities, the source-masking pipeline and the SBF fit engine.

pub mod background;
pub mod detection;
pub mod masking;
pub mod measure;
pub mod result;
pub mod spectral;

pub use background::{measure_background, BackgroundConfig};
pub use detection::{detect_sources, DetectionConfig, SourceDetection};
pub use masking::{
    build_galaxy_mask, elliptical_mask, object_mask, segmentation_mask, EllipticalAperture,
    GalaxyMaskConfig, GalaxyPosition, MaskingStage, SegmentationGrowth,
};
pub use measure::{measure, measure_with, pad_psf, FitInput, FitStage, MeasureConfig};
pub use result::{FitFunction, FitModel, SbfResult};
pub use spectral::{azimuthal_average, k_values, power_spectrum, RadialProfile};
