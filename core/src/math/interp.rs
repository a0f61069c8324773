use serde::{Deserialize, Serialize};

use crate::prelude::{StageError, StageResult};

/// Piecewise-linear interpolant over strictly increasing knots.
///
/// Evaluation outside `[first knot, last knot]` fails instead of extrapolating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearInterpolator {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl LinearInterpolator {
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> StageResult<Self> {
        if x.len() != y.len() {
            return Err(StageError::InvalidInput(format!(
                "interpolant needs matching knot counts, got {} and {}",
                x.len(),
                y.len()
            )));
        }
        if x.len() < 2 {
            return Err(StageError::InvalidInput(
                "interpolant needs at least two knots".into(),
            ));
        }
        if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(StageError::InvalidInput(
                "interpolant knots must be finite".into(),
            ));
        }
        if x.windows(2).any(|pair| pair[1] <= pair[0]) {
            return Err(StageError::InvalidInput(
                "interpolant abscissae must be strictly increasing".into(),
            ));
        }
        Ok(Self { x, y })
    }

    pub fn domain(&self) -> (f64, f64) {
        (self.x[0], self.x[self.x.len() - 1])
    }

    pub fn eval(&self, value: f64) -> StageResult<f64> {
        let (min, max) = self.domain();
        if !(value >= min && value <= max) {
            return Err(StageError::OutOfDomain { value, min, max });
        }

        // first knot strictly greater than `value`, clamped so the last knot is inclusive
        let upper = self
            .x
            .partition_point(|&knot| knot <= value)
            .clamp(1, self.x.len() - 1);
        let lower = upper - 1;
        let (x0, x1) = (self.x[lower], self.x[upper]);
        let (y0, y1) = (self.y[lower], self.y[upper]);
        if value == x1 {
            return Ok(y1);
        }
        let t = (value - x0) / (x1 - x0);
        Ok(y0 + t * (y1 - y0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LinearInterpolator {
        LinearInterpolator::new(vec![0.0, 1.0, 3.0], vec![2.0, 4.0, 0.0]).unwrap()
    }

    #[test]
    fn interpolates_between_knots_and_hits_knots_exactly() {
        let interp = sample();
        assert_eq!(interp.eval(0.0).unwrap(), 2.0);
        assert_eq!(interp.eval(0.5).unwrap(), 3.0);
        assert_eq!(interp.eval(1.0).unwrap(), 4.0);
        assert_eq!(interp.eval(2.0).unwrap(), 2.0);
        assert_eq!(interp.eval(3.0).unwrap(), 0.0);
    }

    #[test]
    fn refuses_to_extrapolate() {
        let interp = sample();
        assert!(matches!(
            interp.eval(3.0001),
            Err(StageError::OutOfDomain { .. })
        ));
        assert!(matches!(
            interp.eval(-0.1),
            Err(StageError::OutOfDomain { .. })
        ));
        assert!(interp.eval(f64::NAN).is_err());
    }

    #[test]
    fn rejects_unsorted_or_short_knots() {
        assert!(LinearInterpolator::new(vec![0.0, 0.0], vec![1.0, 2.0]).is_err());
        assert!(LinearInterpolator::new(vec![0.0], vec![1.0]).is_err());
        assert!(LinearInterpolator::new(vec![0.0, 1.0], vec![1.0]).is_err());
    }
}
