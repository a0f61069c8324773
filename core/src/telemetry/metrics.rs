use std::sync::Mutex;
use std::time::Duration;

/// Run counters shared by a driver across stages.
pub struct MetricsRecorder {
    inner: Mutex<Metrics>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub processed: usize,
    pub errors: usize,
    pub masked_pixels: usize,
    pub elapsed: Duration,
}

#[derive(Default)]
struct Metrics {
    processed: usize,
    errors: usize,
    masked_pixels: usize,
    elapsed: Duration,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Metrics::default()),
        }
    }

    pub fn record_processed(&self, elapsed: Duration) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.processed += 1;
            metrics.elapsed += elapsed;
        }
    }

    pub fn record_error(&self) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.errors += 1;
        }
    }

    pub fn record_masked(&self, pixels: usize) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.masked_pixels += pixels;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        if let Ok(metrics) = self.inner.lock() {
            MetricsSnapshot {
                processed: metrics.processed,
                errors: metrics.errors,
                masked_pixels: metrics.masked_pixels,
                elapsed: metrics.elapsed,
            }
        } else {
            MetricsSnapshot::default()
        }
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}
