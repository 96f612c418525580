//! Retry bookkeeping for placements and plugin calls.
//!
//! Exponential backoff: each consecutive failure doubles the delay up to a
//! ceiling; a success resets it. Crossing the failure threshold is
//! reported once so callers can mark the volume degraded.

use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

/// Tracks consecutive failures of one retried operation.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    consecutive_failures: u32,
    /// Failures tolerated before the operation counts as exhausted.
    threshold: u32,
    current_backoff: Duration,
    base: Duration,
    max: Duration,
    not_before: Option<Instant>,
}

impl RetryTracker {
    pub fn new(base: Duration, max: Duration, threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            threshold: threshold.max(1),
            current_backoff: base,
            base,
            max,
            not_before: None,
        }
    }

    /// Record a failure at `now`. Returns true when this failure crosses the threshold.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures += 1;
        self.not_before = Some(now + self.current_backoff);
        // Exponential backoff: double the delay up to max.
        self.current_backoff = (self.current_backoff * 2).min(self.max);

        let crossed = self.consecutive_failures == self.threshold;
        if crossed {
            warn!(
                failures = self.consecutive_failures,
                threshold = self.threshold,
                "retry threshold reached"
            );
        }
        crossed
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.current_backoff = self.base;
        self.not_before = None;
    }

    /// Whether the backoff delay has elapsed.
    pub fn ready(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|t| now >= t)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn exhausted(&self) -> bool {
        self.consecutive_failures >= self.threshold
    }

    /// Delay that the next failure will impose.
    pub fn next_backoff(&self) -> Duration {
        self.current_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_max() {
        let now = Instant::now();
        let mut tracker = RetryTracker::new(Duration::from_secs(1), Duration::from_secs(5), 10);

        tracker.record_failure(now);
        assert_eq!(tracker.next_backoff(), Duration::from_secs(2));
        tracker.record_failure(now);
        assert_eq!(tracker.next_backoff(), Duration::from_secs(4));
        tracker.record_failure(now);
        assert_eq!(tracker.next_backoff(), Duration::from_secs(5));
        tracker.record_failure(now);
        assert_eq!(tracker.next_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn ready_after_delay() {
        let now = Instant::now();
        let mut tracker = RetryTracker::new(Duration::from_secs(1), Duration::from_secs(60), 3);
        assert!(tracker.ready(now));

        tracker.record_failure(now);
        assert!(!tracker.ready(now));
        assert!(tracker.ready(now + Duration::from_secs(1)));
    }

    #[test]
    fn threshold_crossed_once() {
        let now = Instant::now();
        let mut tracker = RetryTracker::new(Duration::ZERO, Duration::ZERO, 2);
        assert!(!tracker.record_failure(now));
        assert!(tracker.record_failure(now));
        assert!(!tracker.record_failure(now));
        assert!(tracker.exhausted());
        assert_eq!(tracker.consecutive_failures(), 3);
    }

    #[test]
    fn success_resets() {
        let now = Instant::now();
        let mut tracker = RetryTracker::new(Duration::from_secs(1), Duration::from_secs(60), 2);
        tracker.record_failure(now);
        tracker.record_failure(now);
        tracker.record_success();

        assert_eq!(tracker.consecutive_failures(), 0);
        assert!(!tracker.exhausted());
        assert!(tracker.ready(now));
        assert_eq!(tracker.next_backoff(), Duration::from_secs(1));
    }
}
