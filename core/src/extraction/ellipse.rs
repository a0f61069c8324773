use serde::{Deserialize, Serialize};

use crate::prelude::Mask;

/// Ellipse in pixel coordinates: center `(x, y)`, semi-axes `a ≥ b`, angle `theta`
/// (radians, counterclockwise from +x).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EllipseShape {
    pub x: f64,
    pub y: f64,
    pub a: f64,
    pub b: f64,
    pub theta: f64,
}

impl EllipseShape {
    pub fn circle(x: f64, y: f64, radius: f64) -> Self {
        Self {
            x,
            y,
            a: radius,
            b: radius,
            theta: 0.0,
        }
    }

    /// Quadratic-form coefficients `(cxx, cyy, cxy)`.
    pub fn coefficients(&self) -> (f64, f64, f64) {
        let (sin, cos) = self.theta.sin_cos();
        let inv_a2 = 1.0 / (self.a * self.a);
        let inv_b2 = 1.0 / (self.b * self.b);
        let cxx = cos * cos * inv_a2 + sin * sin * inv_b2;
        let cyy = sin * sin * inv_a2 + cos * cos * inv_b2;
        let cxy = 2.0 * cos * sin * (inv_a2 - inv_b2);
        (cxx, cyy, cxy)
    }

    fn is_drawable(&self) -> bool {
        self.a > 0.0
            && self.b > 0.0
            && [self.x, self.y, self.a, self.b, self.theta]
                .iter()
                .all(|v| v.is_finite())
    }

    /// True when pixel center `(px, py)` lies inside the ellipse scaled by `scale`.
    pub fn contains(&self, px: f64, py: f64, scale: f64) -> bool {
        if !self.is_drawable() {
            return false;
        }
        let (cxx, cyy, cxy) = self.coefficients();
        let dx = px - self.x;
        let dy = py - self.y;
        cxx * dx * dx + cyy * dy * dy + cxy * dx * dy <= scale * scale
    }
}

/// Sets every canvas pixel covered by any ellipse scaled by `scale`. Degenerate ellipses
/// (non-positive or non-finite axes) are skipped.
pub fn mask_ellipses(canvas: &mut Mask, ellipses: &[EllipseShape], scale: f64) {
    let (rows, cols) = canvas.dim();
    if rows == 0 || cols == 0 || !(scale > 0.0) {
        return;
    }

    for ellipse in ellipses.iter().filter(|e| e.is_drawable()) {
        let reach = ellipse.a.max(ellipse.b) * scale;
        let x_lo = (ellipse.x - reach).floor().max(0.0) as usize;
        let y_lo = (ellipse.y - reach).floor().max(0.0) as usize;
        let x_hi = (ellipse.x + reach).ceil().min((cols - 1) as f64);
        let y_hi = (ellipse.y + reach).ceil().min((rows - 1) as f64);
        if x_hi < 0.0 || y_hi < 0.0 {
            continue;
        }
        let (x_hi, y_hi) = (x_hi as usize, y_hi as usize);

        for row in y_lo..=y_hi {
            for col in x_lo..=x_hi {
                if ellipse.contains(col as f64, row as f64, scale) {
                    canvas[[row, col]] = true;
                }
            }
        }
    }
}
