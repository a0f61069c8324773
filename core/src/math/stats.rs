use std::cmp::Ordering;

/// Summary produced by iterative sigma clipping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClippedStats {
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    pub count: usize,
}

pub struct StatsHelper;

impl StatsHelper {
    pub fn mean(samples: &[f64]) -> Option<f64> {
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    /// Population standard deviation (ddof = 0).
    pub fn std(samples: &[f64]) -> Option<f64> {
        let mean = Self::mean(samples)?;
        let var = samples.iter().map(|&v| (v - mean) * (v - mean)).sum::<f64>()
            / samples.len() as f64;
        Some(var.sqrt())
    }

    /// Median of the samples; reorders the slice.
    pub fn median_mut(samples: &mut [f64]) -> Option<f64> {
        let n = samples.len();
        if n == 0 {
            return None;
        }
        let cmp = |a: &f64, b: &f64| a.partial_cmp(b).unwrap_or(Ordering::Equal);
        let mid = n / 2;
        let (lower, upper_mid, _) = samples.select_nth_unstable_by(mid, cmp);
        let upper = *upper_mid;
        if n % 2 == 1 {
            return Some(upper);
        }
        let lower_max = lower.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(0.5 * (lower_max + upper))
    }

    pub fn median(samples: &[f64]) -> Option<f64> {
        let mut scratch = samples.to_vec();
        Self::median_mut(&mut scratch)
    }

    /// Iteratively rejects samples further than `nsigma` standard deviations from the
    /// median until nothing changes or `max_iterations` passes have run.
    pub fn sigma_clipped(samples: &[f64], nsigma: f64, max_iterations: usize) -> Option<ClippedStats> {
        let mut kept: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
        if kept.is_empty() {
            return None;
        }

        for _ in 0..max_iterations {
            let median = Self::median(&kept)?;
            let std = Self::std(&kept)?;
            if std == 0.0 {
                break;
            }
            let before = kept.len();
            kept.retain(|&v| (v - median).abs() <= nsigma * std);
            if kept.len() == before || kept.is_empty() {
                break;
            }
        }

        if kept.is_empty() {
            return None;
        }

        Some(ClippedStats {
            mean: Self::mean(&kept)?,
            median: Self::median(&kept)?,
            std: Self::std(&kept)?,
            count: kept.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn median_of_even_and_odd_lengths() {
        assert_eq!(StatsHelper::median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(StatsHelper::median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(StatsHelper::median(&[]), None);
    }

    #[test]
    fn std_is_population_std() {
        let std = StatsHelper::std(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_abs_diff_eq!(std, 1.25f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn sigma_clipping_rejects_outlier() {
        let mut samples = vec![10.0; 50];
        samples.iter_mut().enumerate().for_each(|(i, v)| *v += (i % 5) as f64 * 0.1);
        samples.push(1000.0);
        let stats = StatsHelper::sigma_clipped(&samples, 3.0, 5).unwrap();
        assert_eq!(stats.count, 50);
        assert!(stats.mean < 10.5);
    }
}
