//! Connection quality monitoring.
//!
//! Buckets the live connection by rolling average latency and computes
//! jitter (standard deviation) over a sliding window of samples, for
//! observability only — nothing in the core changes behavior on it.

use std::collections::VecDeque;

/// Samples kept for the rolling average and jitter.
const WINDOW: usize = 20;

/// Coarse quality classification by rolling average latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityBucket {
    /// < 50 ms
    Excellent,
    /// < 100 ms
    Good,
    /// < 200 ms
    Fair,
    /// ≥ 200 ms
    Poor,
}

impl QualityBucket {
    pub fn from_latency_ms(avg_ms: f64) -> Self {
        if avg_ms < 50.0 {
            Self::Excellent
        } else if avg_ms < 100.0 {
            Self::Good
        } else if avg_ms < 200.0 {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

/// Sliding-window latency statistics.
#[derive(Debug, Default)]
pub struct QualityMonitor {
    samples: VecDeque<f64>,
}

impl QualityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one round-trip sample in milliseconds.
    pub fn record(&mut self, sample_ms: f64) {
        if self.samples.len() == WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample_ms);
    }

    /// Rolling average over the window, `None` before any sample.
    pub fn average_ms(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// The current quality bucket.
    pub fn bucket(&self) -> Option<QualityBucket> {
        self.average_ms().map(QualityBucket::from_latency_ms)
    }

    /// Jitter: standard deviation over the window. Needs at least two
    /// samples.
    pub fn jitter_ms(&self) -> Option<f64> {
        if self.samples.len() < 2 {
            return None;
        }
        let mean = self.average_ms()?;
        let variance = self
            .samples
            .iter()
            .map(|s| (s - mean) * (s - mean))
            .sum::<f64>()
            / self.samples.len() as f64;
        Some(variance.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(
            QualityBucket::from_latency_ms(49.9),
            QualityBucket::Excellent
        );
        assert_eq!(QualityBucket::from_latency_ms(50.0), QualityBucket::Good);
        assert_eq!(QualityBucket::from_latency_ms(99.9), QualityBucket::Good);
        assert_eq!(QualityBucket::from_latency_ms(100.0), QualityBucket::Fair);
        assert_eq!(QualityBucket::from_latency_ms(199.9), QualityBucket::Fair);
        assert_eq!(QualityBucket::from_latency_ms(200.0), QualityBucket::Poor);
    }

    #[test]
    fn test_empty_monitor_reports_nothing() {
        let monitor = QualityMonitor::new();
        assert_eq!(monitor.average_ms(), None);
        assert_eq!(monitor.bucket(), None);
        assert_eq!(monitor.jitter_ms(), None);
    }

    #[test]
    fn test_average_and_bucket() {
        let mut monitor = QualityMonitor::new();
        monitor.record(40.0);
        monitor.record(60.0);
        assert_eq!(monitor.average_ms(), Some(50.0));
        assert_eq!(monitor.bucket(), Some(QualityBucket::Good));
    }

    #[test]
    fn test_window_drops_oldest_samples() {
        let mut monitor = QualityMonitor::new();
        monitor.record(1000.0);
        for _ in 0..20 {
            monitor.record(30.0);
        }
        // The 1000 ms outlier fell out of the window.
        assert_eq!(monitor.average_ms(), Some(30.0));
        assert_eq!(monitor.bucket(), Some(QualityBucket::Excellent));
    }

    #[test]
    fn test_jitter_is_stddev() {
        let mut monitor = QualityMonitor::new();
        monitor.record(40.0);
        monitor.record(60.0);
        // Mean 50, deviations ±10 → stddev 10.
        let jitter = monitor.jitter_ms().unwrap();
        assert!((jitter - 10.0).abs() < 1e-9, "got {jitter}");
    }

    #[test]
    fn test_steady_connection_has_zero_jitter() {
        let mut monitor = QualityMonitor::new();
        for _ in 0..5 {
            monitor.record(42.0);
        }
        assert_eq!(monitor.jitter_ms(), Some(0.0));
    }
}
