//! Core numerical pipeline for surface brightness fluctuation (SBF) measurements.
//!
//! Contaminating sources around a target galaxy are detected and masked, then the
//! azimuthally averaged power spectrum of a normalized residual image is fit with a
//! scaled PSF power spectrum plus a white-noise floor.

pub mod extraction;
pub mod io;
pub mod math;
pub mod prelude;
pub mod processing;
pub mod telemetry;

pub use io::ImageSource;
pub use prelude::{Image, Mask, ProcessingStage, StageError, StageResult};
pub use processing::{
    build_galaxy_mask, detect_sources, measure, FitModel, GalaxyMaskConfig, MeasureConfig,
    SbfResult,
};
