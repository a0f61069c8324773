use ndarray::Array2;

/// Floating-point image plane, rows first.
pub type Image = Array2<f64>;

/// Boolean pixel mask; `true` marks an excluded pixel.
pub type Mask = Array2<bool>;

/// Common error type for every pipeline step.
#[derive(thiserror::Error, Debug)]
pub enum StageError {
    #[error("shape mismatch in {context}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        context: String,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("wavenumber {value} outside interpolation domain [{min}, {max}]")]
    OutOfDomain { value: f64, min: f64, max: f64 },
    #[error("fit did not converge after {iterations} iterations (chi2 {chi2:.6e}): {reason}")]
    FitConvergence {
        iterations: usize,
        chi2: f64,
        reason: String,
    },
    #[error("radial bin {bin} of {num_bins} contains no pixels")]
    DegenerateBin { bin: usize, num_bins: usize },
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("image container failure: {0}")]
    Container(String),
    #[error("internal failure: {0}")]
    Internal(String),
}

pub type StageResult<T> = Result<T, StageError>;

impl StageError {
    pub(crate) fn shape(
        context: impl Into<String>,
        expected: (usize, usize),
        found: (usize, usize),
    ) -> Self {
        StageError::ShapeMismatch {
            context: context.into(),
            expected,
            found,
        }
    }
}

/// Fails with `ShapeMismatch` unless `found` equals `expected`.
pub(crate) fn ensure_shape(
    context: &str,
    expected: (usize, usize),
    found: (usize, usize),
) -> StageResult<()> {
    if expected != found {
        return Err(StageError::shape(context, expected, found));
    }
    Ok(())
}

/// Fails with `InvalidInput` if any pixel is NaN or infinite.
pub(crate) fn ensure_finite(context: &str, data: &Array2<f64>) -> StageResult<()> {
    if let Some(((row, col), value)) = data.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(StageError::InvalidInput(format!(
            "{} contains non-finite value {} at ({}, {})",
            context, value, row, col
        )));
    }
    Ok(())
}

/// Trait describing the stateful pipeline stages used by drivers.
pub trait ProcessingStage {
    type Config;
    type Input;
    type Output;

    fn initialize(&mut self, config: &Self::Config) -> StageResult<()>;
    fn execute(&mut self, input: Self::Input) -> StageResult<Self::Output>;
    fn cleanup(&mut self);
}
