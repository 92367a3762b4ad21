//! Per-connection protocol guards.
//!
//! The frame-codec contract makes two promises about misbehaving or
//! merely-newer peers: parse errors are never fatal on their own, and
//! unknown tags warn at most once a minute. Both are small windowed
//! counters; they live here so the hub handler and any future client
//! share one implementation.

use std::time::{Duration, Instant};

/// Counts parse errors per peer inside a sliding window.
///
/// The connection survives individual bad frames; it is dropped with
/// PROTOCOL_ERROR once more than `threshold` errors land within
/// `window`. Defaults: 16 errors / 60 s.
#[derive(Debug)]
pub struct ParseErrorWindow {
    threshold: u32,
    window: Duration,
    count: u32,
    window_start: Option<Instant>,
}

impl ParseErrorWindow {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            count: 0,
            window_start: None,
        }
    }

    /// Records one parse error. Returns `true` when the threshold has
    /// been crossed and the peer should be disconnected.
    pub fn record(&mut self) -> bool {
        let now = Instant::now();
        match self.window_start {
            Some(start) if now.duration_since(start) < self.window => {
                self.count += 1;
            }
            _ => {
                self.window_start = Some(now);
                self.count = 1;
            }
        }
        self.count > self.threshold
    }

    /// Errors recorded in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }
}

impl Default for ParseErrorWindow {
    fn default() -> Self {
        Self::new(16, Duration::from_secs(60))
    }
}

/// Rate-limits the UNKNOWN_TYPE warning to once per interval per
/// connection. Default interval: 60 s.
#[derive(Debug)]
pub struct UnknownTypeThrottle {
    interval: Duration,
    last_warned: Option<Instant>,
}

impl UnknownTypeThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_warned: None,
        }
    }

    /// Returns `true` if a warning may be emitted now (and records it).
    pub fn should_warn(&mut self) -> bool {
        let now = Instant::now();
        match self.last_warned {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_warned = Some(now);
                true
            }
        }
    }
}

impl Default for UnknownTypeThrottle {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_errors_below_threshold_do_not_trip() {
        let mut window = ParseErrorWindow::new(16, Duration::from_secs(60));
        for _ in 0..16 {
            assert!(!window.record());
        }
        assert_eq!(window.count(), 16);
    }

    #[test]
    fn test_parse_error_over_threshold_trips() {
        let mut window = ParseErrorWindow::new(16, Duration::from_secs(60));
        for _ in 0..16 {
            window.record();
        }
        // The 17th error within the window crosses "exceeds 16".
        assert!(window.record());
    }

    #[test]
    fn test_window_expiry_resets_count() {
        // Zero-length window: every error starts a fresh window, so the
        // threshold can never be crossed.
        let mut window = ParseErrorWindow::new(1, Duration::ZERO);
        assert!(!window.record());
        assert!(!window.record());
        assert!(!window.record());
        assert_eq!(window.count(), 1);
    }

    #[test]
    fn test_throttle_warns_once_per_interval() {
        let mut throttle = UnknownTypeThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_warn());
        assert!(!throttle.should_warn());
        assert!(!throttle.should_warn());
    }

    #[test]
    fn test_throttle_zero_interval_always_warns() {
        let mut throttle = UnknownTypeThrottle::new(Duration::ZERO);
        assert!(throttle.should_warn());
        assert!(throttle.should_warn());
    }
}
