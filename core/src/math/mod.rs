pub mod fft;
pub mod filter;
pub mod interp;
pub mod lm;
pub mod matrix;
pub mod stats;

pub use fft::FftHelper;
pub use interp::LinearInterpolator;
pub use lm::{CurveFit, CurveFitOptions, CurveFitter, LevenbergMarquardt};
pub use matrix::MatrixHelper;
pub use stats::StatsHelper;
