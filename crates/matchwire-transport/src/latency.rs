//! Heartbeat timing, RTT smoothing, and the reconnect schedule.

use std::time::Duration;

// ---------------------------------------------------------------------------
// LatencyTracker
// ---------------------------------------------------------------------------

/// Exponentially smoothed round-trip latency.
///
/// Each PONG yields one raw RTT sample (`now − ping timestamp`); the
/// tracker folds it in with `smoothed = α·sample + (1−α)·smoothed`,
/// α = 0.3. The first sample seeds the estimate directly.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    alpha: f64,
    smoothed_ms: Option<f64>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            alpha: 0.3,
            smoothed_ms: None,
        }
    }

    /// Folds one RTT sample (milliseconds) into the estimate.
    pub fn record(&mut self, sample_ms: f64) {
        self.smoothed_ms = Some(match self.smoothed_ms {
            None => sample_ms,
            Some(prev) => self.alpha * sample_ms + (1.0 - self.alpha) * prev,
        });
    }

    /// The current smoothed estimate, or `None` before the first pong.
    pub fn latency_ms(&self) -> Option<f64> {
        self.smoothed_ms
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// HeartbeatConfig
// ---------------------------------------------------------------------------

/// Heartbeat timing: a PING every `interval`, and the connection is
/// declared lost after `max_missed` consecutive unanswered pings.
/// Defaults (5 s × 6) put loss detection at roughly 30 s.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_missed: 6,
        }
    }
}

// ---------------------------------------------------------------------------
// ReconnectPolicy
// ---------------------------------------------------------------------------

/// The client reconnect schedule: up to `max_attempts` tries with a
/// linearly growing delay of `backoff_step × attempt` (2 s, 4 s, 6 s,
/// 8 s, 10 s with the defaults).
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl ReconnectPolicy {
    /// The delay before the given attempt (1-based), or `None` once the
    /// attempts are exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            None
        } else {
            Some(self.backoff_step * attempt)
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_step: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_seeds_estimate() {
        let mut t = LatencyTracker::new();
        assert_eq!(t.latency_ms(), None);
        t.record(100.0);
        assert_eq!(t.latency_ms(), Some(100.0));
    }

    #[test]
    fn test_smoothing_uses_alpha_point_three() {
        let mut t = LatencyTracker::new();
        t.record(100.0);
        t.record(200.0);
        // 0.3·200 + 0.7·100 = 130
        let est = t.latency_ms().unwrap();
        assert!((est - 130.0).abs() < 1e-9, "got {est}");
    }

    #[test]
    fn test_smoothing_converges_toward_stable_rtt() {
        let mut t = LatencyTracker::new();
        t.record(500.0);
        for _ in 0..50 {
            t.record(40.0);
        }
        let est = t.latency_ms().unwrap();
        assert!((est - 40.0).abs() < 1.0, "got {est}");
    }

    #[test]
    fn test_reconnect_schedule_is_linear() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<_> = (1..=5)
            .map(|a| policy.delay(a).unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 6, 8, 10]);
    }

    #[test]
    fn test_reconnect_exhausts_after_max_attempts() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(6), None);
        assert_eq!(policy.delay(0), None);
    }

    #[test]
    fn test_heartbeat_defaults_detect_loss_within_window() {
        let hb = HeartbeatConfig::default();
        // 6 missed pongs at a 5 s cadence ≈ 30 s to declare loss.
        let worst_case = hb.interval * hb.max_missed;
        assert_eq!(worst_case.as_secs(), 30);
    }
}
