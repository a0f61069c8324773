use log::debug;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::extraction::{Background, SourceExtractor};
use crate::prelude::{Image, StageError, StageResult};

/// Box and filter geometry for background estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Side of the square background boxes (pixels).
    pub box_size: usize,
    /// Median-filter window as a fraction of `box_size`.
    pub filter_frac_of_box: f64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            box_size: 110,
            filter_frac_of_box: 0.5,
        }
    }
}

impl BackgroundConfig {
    pub fn with_box_size(box_size: usize) -> Self {
        Self {
            box_size,
            ..Default::default()
        }
    }

    /// Filter window side, `round(filter_frac_of_box · box_size)`.
    pub fn filter_size(&self) -> usize {
        (self.filter_frac_of_box * self.box_size as f64).round().max(0.0) as usize
    }

    fn validate(&self) -> StageResult<()> {
        if self.box_size == 0 {
            return Err(StageError::InvalidInput("background box size must be positive".into()));
        }
        if !(self.filter_frac_of_box.is_finite() && self.filter_frac_of_box >= 0.0) {
            return Err(StageError::InvalidInput(format!(
                "filter fraction must be finite and non-negative, got {}",
                self.filter_frac_of_box
            )));
        }
        Ok(())
    }
}

/// Fits the background of `image` and, when `subtract` is set, also returns the
/// background-subtracted copy. `image` itself is never modified.
pub fn measure_background(
    extractor: &dyn SourceExtractor,
    image: ArrayView2<f64>,
    config: &BackgroundConfig,
    mask: Option<ArrayView2<bool>>,
    subtract: bool,
) -> StageResult<(Background, Option<Image>)> {
    config.validate()?;
    let size = config.box_size;
    let filter = config.filter_size();
    let background = extractor.estimate_background(image, mask, size, size, filter, filter)?;
    debug!(
        "background boxes {}x{}, filter {}x{}: global rms {:.4}",
        size,
        size,
        filter,
        filter,
        background.global_rms()
    );

    let subtracted = if subtract {
        Some(background.subtracted(image)?)
    } else {
        None
    };
    Ok((background, subtracted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::MeshExtractor;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    #[test]
    fn filter_size_rounds() {
        assert_eq!(BackgroundConfig::with_box_size(110).filter_size(), 55);
        assert_eq!(BackgroundConfig::with_box_size(16).filter_size(), 8);
        let config = BackgroundConfig {
            box_size: 5,
            filter_frac_of_box: 0.5,
        };
        assert_eq!(config.filter_size(), 3);
    }

    #[test]
    fn subtraction_is_optional_and_leaves_input_alone() {
        let image = Array2::from_elem((32, 32), 7.0);
        let config = BackgroundConfig::with_box_size(16);
        let (background, none) =
            measure_background(&MeshExtractor, image.view(), &config, None, false).unwrap();
        assert!(none.is_none());
        assert_abs_diff_eq!(background.global_level(), 7.0, epsilon = 1e-12);

        let (_, some) = measure_background(&MeshExtractor, image.view(), &config, None, true).unwrap();
        assert!(some.unwrap().iter().all(|v| v.abs() < 1e-12));
        assert!(image.iter().all(|&v| v == 7.0));
    }

    #[test]
    fn zero_box_is_rejected() {
        let image = Array2::from_elem((8, 8), 1.0);
        let config = BackgroundConfig::with_box_size(0);
        assert!(measure_background(&MeshExtractor, image.view(), &config, None, true).is_err());
    }

    #[test]
    fn config_defaults_missing_fields() {
        let config: BackgroundConfig = serde_json::from_str(r#"{"box_size": 64}"#).unwrap();
        assert_eq!(config.box_size, 64);
        assert_eq!(config.filter_frac_of_box, 0.5);
    }
}
