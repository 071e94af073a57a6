use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Per-service latch that suppresses automatic recovery once health checks
/// keep failing.
///
/// Opens when `failure_count` reaches the threshold. Closes when enough
/// consecutive successes accumulate, or when [`maybe_reset`](Self::maybe_reset)
/// finds no failure within the reset window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    /// Whether automatic recovery is suppressed.
    pub is_open: bool,
    /// Failures since the counters were last cleared.
    pub failure_count: u32,
    /// Successes since the last failure.
    pub success_count: u32,
    /// Wall-clock time of the last failure.
    pub last_failure: Option<DateTime<Utc>>,
    /// Wall-clock time of the last success.
    pub last_success: Option<DateTime<Utc>>,
    #[serde(skip)]
    last_failure_at: Option<Instant>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerState {
    /// A closed breaker with zeroed counters.
    pub fn new() -> Self {
        Self {
            is_open: false,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            last_success: None,
            last_failure_at: None,
        }
    }

    /// Records a failed check. Returns `true` if this call opened the breaker.
    pub fn record_failure(&mut self, now: Instant, threshold: u32) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.success_count = 0;
        self.last_failure = Some(Utc::now());
        self.last_failure_at = Some(now);
        if !self.is_open && self.failure_count >= threshold {
            self.is_open = true;
            return true;
        }
        false
    }

    /// Records a successful check. Returns `true` if this call closed the
    /// breaker.
    pub fn record_success(&mut self, threshold: u32) -> bool {
        self.success_count = self.success_count.saturating_add(1);
        self.last_success = Some(Utc::now());
        if self.success_count >= threshold {
            self.failure_count = 0;
            if self.is_open {
                self.is_open = false;
                return true;
            }
        }
        false
    }

    /// Returns `true` if the breaker is open and no failure has been seen for
    /// longer than `window`.
    pub fn should_reset(&self, now: Instant, window: Duration) -> bool {
        self.is_open
            && self
                .last_failure_at
                .is_some_and(|at| now.saturating_duration_since(at) > window)
    }

    /// Force-closes the breaker and zeroes its counters if
    /// [`should_reset`](Self::should_reset) holds. Returns `true` on reset.
    pub fn maybe_reset(&mut self, now: Instant, window: Duration) -> bool {
        if !self.should_reset(now, window) {
            return false;
        }
        self.is_open = false;
        self.failure_count = 0;
        self.success_count = 0;
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const THRESHOLD: u32 = 5;
    const WINDOW: Duration = Duration::from_secs(300);

    #[test]
    fn test_opens_after_threshold_failures() {
        let mut breaker = CircuitBreakerState::new();
        let now = Instant::now();
        for _ in 0..4 {
            assert!(!breaker.record_failure(now, THRESHOLD));
        }
        assert!(!breaker.is_open);
        assert!(breaker.record_failure(now, THRESHOLD));
        assert!(breaker.is_open);
        assert_eq!(breaker.failure_count, 5);
        // Further failures keep it open without re-reporting.
        assert!(!breaker.record_failure(now, THRESHOLD));
    }

    #[test]
    fn test_failure_resets_success_streak() {
        let mut breaker = CircuitBreakerState::new();
        let now = Instant::now();
        breaker.record_success(THRESHOLD);
        breaker.record_success(THRESHOLD);
        breaker.record_failure(now, THRESHOLD);
        assert_eq!(breaker.success_count, 0);
        assert_eq!(breaker.failure_count, 1);
    }

    #[test]
    fn test_success_streak_closes_breaker() {
        let mut breaker = CircuitBreakerState::new();
        let now = Instant::now();
        for _ in 0..THRESHOLD {
            breaker.record_failure(now, THRESHOLD);
        }
        for _ in 0..4 {
            assert!(!breaker.record_success(THRESHOLD));
            assert!(breaker.is_open);
        }
        assert!(breaker.record_success(THRESHOLD));
        assert!(!breaker.is_open);
        assert_eq!(breaker.failure_count, 0);
    }

    #[test]
    fn test_closes_after_reset_window_and_one_success() {
        let mut breaker = CircuitBreakerState::new();
        let opened_at = Instant::now();
        for _ in 0..THRESHOLD {
            breaker.record_failure(opened_at, THRESHOLD);
        }
        assert!(breaker.is_open);

        let early = opened_at + Duration::from_secs(120);
        assert!(!breaker.maybe_reset(early, WINDOW));
        assert!(breaker.is_open);

        let later = opened_at + Duration::from_secs(360);
        assert!(breaker.maybe_reset(later, WINDOW));
        breaker.record_success(THRESHOLD);
        assert!(!breaker.is_open);
        assert_eq!(breaker.failure_count, 0);
        assert_eq!(breaker.success_count, 1);
    }

    #[test]
    fn test_closed_breaker_never_resets() {
        let mut breaker = CircuitBreakerState::new();
        let now = Instant::now();
        breaker.record_failure(now, THRESHOLD);
        assert!(!breaker.should_reset(now + Duration::from_secs(3600), WINDOW));
    }

    #[test]
    fn test_snapshot_serialization() {
        let breaker = CircuitBreakerState::new();
        let json = serde_json::to_value(&breaker).unwrap();
        assert_eq!(json["isOpen"], false);
        assert_eq!(json["failureCount"], 0);
        assert!(json.get("lastFailureAt").is_none());
    }
}
