//! Mesh background model: per-box clipped statistics, median-filtered across boxes and
//! bilinearly interpolated back to full resolution.

use log::debug;
use ndarray::{Array2, ArrayView2};

use crate::math::stats::{ClippedStats, StatsHelper};
use crate::prelude::{ensure_shape, Image, StageError, StageResult};

const CLIP_SIGMA: f64 = 3.0;
const CLIP_ITERATIONS: usize = 5;
/// Boxes where `|mean - median|` exceeds this many sigma are crowded; fall back to median.
const CROWDING_LIMIT: f64 = 0.3;
/// Minimum usable fraction of a box's pixels.
const MIN_BOX_COVERAGE: f64 = 0.5;

/// Smooth background level and noise maps plus their global summaries.
#[derive(Debug, Clone, PartialEq)]
pub struct Background {
    level: Image,
    rms: Image,
    global_level: f64,
    global_rms: f64,
}

/// Box statistics laid out `ny × nx`.
struct BoxMesh {
    nx: usize,
    ny: usize,
    level: Vec<f64>,
    rms: Vec<f64>,
    x_centers: Vec<f64>,
    y_centers: Vec<f64>,
}

fn box_centers(length: usize, size: usize) -> Vec<f64> {
    (0..length)
        .step_by(size)
        .map(|start| {
            let end = (start + size).min(length);
            (start + end - 1) as f64 / 2.0
        })
        .collect()
}

fn box_level(stats: &ClippedStats) -> f64 {
    if (stats.mean - stats.median).abs() > CROWDING_LIMIT * stats.std {
        stats.median
    } else {
        2.5 * stats.median - 1.5 * stats.mean
    }
}

impl BoxMesh {
    fn measure(
        image: ArrayView2<f64>,
        mask: Option<ArrayView2<bool>>,
        box_width: usize,
        box_height: usize,
    ) -> StageResult<Self> {
        let (rows, cols) = image.dim();
        let x_centers = box_centers(cols, box_width);
        let y_centers = box_centers(rows, box_height);
        let (nx, ny) = (x_centers.len(), y_centers.len());

        let mut level = vec![0.0; nx * ny];
        let mut rms = vec![0.0; nx * ny];
        let mut valid = vec![false; nx * ny];
        let mut samples = Vec::with_capacity(box_width * box_height);

        for by in 0..ny {
            let y0 = by * box_height;
            let y1 = (y0 + box_height).min(rows);
            for bx in 0..nx {
                let x0 = bx * box_width;
                let x1 = (x0 + box_width).min(cols);

                samples.clear();
                for r in y0..y1 {
                    for c in x0..x1 {
                        let excluded = mask.as_ref().map_or(false, |m| m[[r, c]]);
                        let value = image[[r, c]];
                        if !excluded && value.is_finite() {
                            samples.push(value);
                        }
                    }
                }

                let area = (y1 - y0) * (x1 - x0);
                if (samples.len() as f64) < MIN_BOX_COVERAGE * area as f64 {
                    continue;
                }
                if let Some(stats) = StatsHelper::sigma_clipped(&samples, CLIP_SIGMA, CLIP_ITERATIONS) {
                    let idx = by * nx + bx;
                    level[idx] = box_level(&stats);
                    rms[idx] = stats.std;
                    valid[idx] = true;
                }
            }
        }

        let usable = valid.iter().filter(|v| **v).count();
        if usable == 0 {
            return Err(StageError::InvalidInput(format!(
                "no background box has enough unmasked pixels ({} boxes of {}x{})",
                nx * ny,
                box_width,
                box_height
            )));
        }
        if usable < valid.len() {
            let fill_level = mean_where(&level, &valid);
            let fill_rms = mean_where(&rms, &valid);
            for (idx, ok) in valid.iter().enumerate() {
                if !ok {
                    level[idx] = fill_level;
                    rms[idx] = fill_rms;
                }
            }
            debug!(
                "background: {} of {} boxes under-covered, filled with mean level {:.4}",
                valid.len() - usable,
                valid.len(),
                fill_level
            );
        }

        Ok(Self {
            nx,
            ny,
            level,
            rms,
            x_centers,
            y_centers,
        })
    }

    fn median_filter(&mut self, filter_width: usize, filter_height: usize) {
        if filter_width <= 1 && filter_height <= 1 {
            return;
        }
        self.level = filter_mesh(&self.level, self.nx, self.ny, filter_width, filter_height);
        self.rms = filter_mesh(&self.rms, self.nx, self.ny, filter_width, filter_height);
    }

    fn interpolate(&self, values: &[f64], shape: (usize, usize)) -> Image {
        let x_weights: Vec<(usize, usize, f64)> =
            (0..shape.1).map(|c| bracket(&self.x_centers, c as f64)).collect();
        let y_weights: Vec<(usize, usize, f64)> =
            (0..shape.0).map(|r| bracket(&self.y_centers, r as f64)).collect();
        let nx = self.nx;

        Array2::from_shape_fn(shape, |(r, c)| {
            let (y0, y1, ty) = y_weights[r];
            let (x0, x1, tx) = x_weights[c];
            let top = values[y0 * nx + x0] * (1.0 - tx) + values[y0 * nx + x1] * tx;
            let bottom = values[y1 * nx + x0] * (1.0 - tx) + values[y1 * nx + x1] * tx;
            top * (1.0 - ty) + bottom * ty
        })
    }
}

fn mean_where(values: &[f64], valid: &[bool]) -> f64 {
    let kept: Vec<f64> = values
        .iter()
        .zip(valid)
        .filter(|(_, ok)| **ok)
        .map(|(v, _)| *v)
        .collect();
    StatsHelper::mean(&kept).unwrap_or(0.0)
}

fn filter_mesh(values: &[f64], nx: usize, ny: usize, width: usize, height: usize) -> Vec<f64> {
    let (half_x, half_y) = (width / 2, height / 2);
    let mut window = Vec::with_capacity(width.max(1) * height.max(1));
    let mut out = vec![0.0; values.len()];
    for by in 0..ny {
        let (y_lo, y_hi) = (by.saturating_sub(half_y), (by + half_y).min(ny - 1));
        for bx in 0..nx {
            let (x_lo, x_hi) = (bx.saturating_sub(half_x), (bx + half_x).min(nx - 1));
            window.clear();
            for y in y_lo..=y_hi {
                window.extend_from_slice(&values[y * nx + x_lo..=y * nx + x_hi]);
            }
            out[by * nx + bx] = StatsHelper::median_mut(&mut window).unwrap_or(values[by * nx + bx]);
        }
    }
    out
}

/// Neighboring centers around `position` and the weight of the upper one, clamped at the
/// outermost centers.
fn bracket(centers: &[f64], position: f64) -> (usize, usize, f64) {
    let last = centers.len() - 1;
    if last == 0 || position <= centers[0] {
        return (0, 0, 0.0);
    }
    if position >= centers[last] {
        return (last, last, 0.0);
    }
    let upper = centers.partition_point(|&center| center <= position).min(last);
    let lower = upper - 1;
    let t = (position - centers[lower]) / (centers[upper] - centers[lower]);
    (lower, upper, t)
}

impl Background {
    /// Estimates the background of `image` using `box_width × box_height` boxes and a
    /// median filter spanning `filter_width × filter_height` boxes. Pixels flagged in `mask`
    /// and non-finite pixels are ignored.
    pub fn estimate(
        image: ArrayView2<f64>,
        mask: Option<ArrayView2<bool>>,
        box_width: usize,
        box_height: usize,
        filter_width: usize,
        filter_height: usize,
    ) -> StageResult<Self> {
        let shape = image.dim();
        if shape.0 == 0 || shape.1 == 0 {
            return Err(StageError::InvalidInput("background of an empty image".into()));
        }
        if box_width == 0 || box_height == 0 {
            return Err(StageError::InvalidInput(format!(
                "background box must be at least 1x1, got {}x{}",
                box_width, box_height
            )));
        }
        if let Some(mask) = mask.as_ref() {
            ensure_shape("background mask", shape, mask.dim())?;
        }

        let mut mesh = BoxMesh::measure(image, mask, box_width, box_height)?;
        mesh.median_filter(filter_width, filter_height);

        let global_level = StatsHelper::median(&mesh.level).unwrap_or(0.0);
        let global_rms = StatsHelper::median(&mesh.rms).unwrap_or(0.0);
        debug!(
            "background mesh {}x{}: global level {:.4}, global rms {:.4}",
            mesh.nx, mesh.ny, global_level, global_rms
        );

        Ok(Self {
            level: mesh.interpolate(&mesh.level, shape),
            rms: mesh.interpolate(&mesh.rms, shape),
            global_level,
            global_rms,
        })
    }

    pub fn global_level(&self) -> f64 {
        self.global_level
    }

    pub fn global_rms(&self) -> f64 {
        self.global_rms
    }

    pub fn level(&self) -> &Image {
        &self.level
    }

    pub fn rms(&self) -> &Image {
        &self.rms
    }

    pub fn shape(&self) -> (usize, usize) {
        self.level.dim()
    }

    /// Subtracts the level map from `image` in place.
    pub fn subtract_from(&self, image: &mut Image) -> StageResult<()> {
        ensure_shape("background subtraction", self.shape(), image.dim())?;
        *image -= &self.level;
        Ok(())
    }

    pub fn subtracted(&self, image: ArrayView2<f64>) -> StageResult<Image> {
        let mut out = image.to_owned();
        self.subtract_from(&mut out)?;
        Ok(out)
    }
}
