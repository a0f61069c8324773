//! Connected-component labeling and per-object shape moments.

use std::collections::VecDeque;
use std::f64::consts::FRAC_PI_4;

use ndarray::{Array2, ArrayView2};

use crate::extraction::{Connectivity, SourceRecord};

/// Determinant below which an object is treated as unresolved along some axis.
const MOMENT_DET_FLOOR: f64 = 1.0 / 144.0;
/// Variance of a uniform unit pixel.
const PIXEL_VARIANCE: f64 = 1.0 / 12.0;

const FOUR_NEIGHBORS: [(isize, isize); 4] = [(-1, 0), (0, -1), (0, 1), (1, 0)];
const EIGHT_NEIGHBORS: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

/// Groups `true` pixels into connected components, scanning in raster order.
///
/// Returns the label image (component `i` carries label `i + 1`) and the pixel lists in
/// the same order.
pub fn label_components(
    detected: ArrayView2<bool>,
    connectivity: Connectivity,
) -> (Array2<u32>, Vec<Vec<(usize, usize)>>) {
    let (rows, cols) = detected.dim();
    let mut labels = Array2::<u32>::zeros((rows, cols));
    let mut components = Vec::new();
    let neighbors: &[(isize, isize)] = match connectivity {
        Connectivity::Four => &FOUR_NEIGHBORS,
        Connectivity::Eight => &EIGHT_NEIGHBORS,
    };

    let mut queue = VecDeque::new();
    for row in 0..rows {
        for col in 0..cols {
            if !detected[[row, col]] || labels[[row, col]] != 0 {
                continue;
            }
            let label = components.len() as u32 + 1;
            let mut pixels = Vec::new();
            labels[[row, col]] = label;
            queue.push_back((row, col));

            while let Some((r, c)) = queue.pop_front() {
                pixels.push((r, c));
                for &(dr, dc) in neighbors {
                    let nr = r as isize + dr;
                    let nc = c as isize + dc;
                    if nr < 0 || nc < 0 || nr >= rows as isize || nc >= cols as isize {
                        continue;
                    }
                    let (nr, nc) = (nr as usize, nc as usize);
                    if detected[[nr, nc]] && labels[[nr, nc]] == 0 {
                        labels[[nr, nc]] = label;
                        queue.push_back((nr, nc));
                    }
                }
            }
            components.push(pixels);
        }
    }

    (labels, components)
}

/// Centroid and second-moment ellipse of one component measured on `image`.
pub fn measure_object(image: ArrayView2<f64>, pixels: &[(usize, usize)]) -> SourceRecord {
    let values: Vec<f64> = pixels.iter().map(|&(r, c)| image[[r, c]]).collect();
    let flux: f64 = values.iter().sum();
    let peak = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let mut weights: Vec<f64> = values.iter().map(|v| v.max(0.0)).collect();
    let mut total: f64 = weights.iter().sum();
    if !(total > 0.0) {
        weights.iter_mut().for_each(|w| *w = 1.0);
        total = weights.len() as f64;
    }

    let (mut sx, mut sy) = (0.0, 0.0);
    for (&(r, c), &w) in pixels.iter().zip(&weights) {
        sx += w * c as f64;
        sy += w * r as f64;
    }
    let x = sx / total;
    let y = sy / total;

    let (mut x2, mut y2, mut xy) = (0.0, 0.0, 0.0);
    for (&(r, c), &w) in pixels.iter().zip(&weights) {
        let dx = c as f64 - x;
        let dy = r as f64 - y;
        x2 += w * dx * dx;
        y2 += w * dy * dy;
        xy += w * dx * dy;
    }
    x2 /= total;
    y2 /= total;
    xy /= total;

    if x2 * y2 - xy * xy < MOMENT_DET_FLOOR {
        x2 += PIXEL_VARIANCE;
        y2 += PIXEL_VARIANCE;
    }

    let theta = if x2 == y2 {
        FRAC_PI_4
    } else {
        0.5 * (2.0 * xy).atan2(x2 - y2)
    };
    let mean = 0.5 * (x2 + y2);
    let spread = (0.25 * (x2 - y2) * (x2 - y2) + xy * xy).sqrt();
    let a = (mean + spread).sqrt();
    let b = (mean - spread).max(0.0).sqrt();

    SourceRecord {
        x,
        y,
        a,
        b,
        theta,
        flux,
        peak,
        npix: pixels.len(),
    }
}
