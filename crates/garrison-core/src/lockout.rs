//! Kiosk-wide lockout after repeated liveness failures.
//!
//! `Normal --N consecutive failures--> Locked(until) --wall clock--> Normal`.
//! Expiry is a timestamp comparison made by the caller each iteration.

use chrono::{DateTime, Duration, Local};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 10;
pub const DEFAULT_LOCKOUT_SECS: i64 = 30;

/// What a single liveness failure did to the lockout state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still below the threshold.
    Counting { consecutive: u32 },
    /// This failure engaged the lockout. Fires once per lockout.
    Engaged { until: DateTime<Local> },
    /// A lockout was already active.
    AlreadyLocked,
}

impl FailureOutcome {
    pub fn locked_out(&self) -> bool {
        !matches!(self, FailureOutcome::Counting { .. })
    }
}

#[derive(Debug, Clone)]
pub struct SpoofLockout {
    threshold: u32,
    duration: Duration,
    consecutive_failures: u32,
    locked_until: Option<DateTime<Local>>,
}

impl Default for SpoofLockout {
    fn default() -> Self {
        Self::new(
            DEFAULT_FAILURE_THRESHOLD,
            Duration::seconds(DEFAULT_LOCKOUT_SECS),
        )
    }
}

impl SpoofLockout {
    pub fn new(threshold: u32, duration: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            duration,
            consecutive_failures: 0,
            locked_until: None,
        }
    }

    pub fn is_locked(&self, now: DateTime<Local>) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }

    /// Time left on an active lockout.
    pub fn remaining(&self, now: DateTime<Local>) -> Option<Duration> {
        self.locked_until
            .filter(|&until| now < until)
            .map(|until| until - now)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Count one failed liveness observation.
    pub fn observe_liveness_failure(&mut self, now: DateTime<Local>) -> FailureOutcome {
        if self.is_locked(now) {
            return FailureOutcome::AlreadyLocked;
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures < self.threshold {
            return FailureOutcome::Counting {
                consecutive: self.consecutive_failures,
            };
        }

        let until = now + self.duration;
        self.consecutive_failures = 0;
        self.locked_until = Some(until);
        tracing::warn!(%until, "liveness failure threshold reached; locking out recognition");
        FailureOutcome::Engaged { until }
    }

    /// A successful liveness observation resets the failure count.
    /// An active lockout still runs to its end.
    pub fn observe_liveness_success(&mut self) {
        self.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Local> {
        Local.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_tenth_failure_engages_lockout() {
        let mut lock = SpoofLockout::default();
        let now = t0();
        for i in 1..=9 {
            let outcome = lock.observe_liveness_failure(now);
            assert_eq!(outcome, FailureOutcome::Counting { consecutive: i });
            assert!(!lock.is_locked(now));
        }
        let outcome = lock.observe_liveness_failure(now);
        assert_eq!(outcome, FailureOutcome::Engaged { until: now + Duration::seconds(30) });
        assert!(outcome.locked_out());
        assert!(lock.is_locked(now));
    }

    #[test]
    fn test_success_does_not_end_active_lockout() {
        let mut lock = SpoofLockout::default();
        let now = t0();
        for _ in 0..10 {
            lock.observe_liveness_failure(now);
        }
        lock.observe_liveness_success();
        assert!(lock.is_locked(now + Duration::seconds(1)));
        assert!(lock.is_locked(now + Duration::seconds(29)));
    }

    #[test]
    fn test_lockout_expires() {
        let mut lock = SpoofLockout::default();
        let now = t0();
        for _ in 0..10 {
            lock.observe_liveness_failure(now);
        }
        assert!(!lock.is_locked(now + Duration::seconds(30)));
        assert_eq!(lock.remaining(now + Duration::seconds(31)), None);
        assert_eq!(lock.remaining(now + Duration::seconds(10)), Some(Duration::seconds(20)));
    }

    #[test]
    fn test_success_resets_counter() {
        let mut lock = SpoofLockout::default();
        let now = t0();
        for _ in 0..9 {
            lock.observe_liveness_failure(now);
        }
        lock.observe_liveness_success();
        assert_eq!(lock.consecutive_failures(), 0);
        assert_eq!(
            lock.observe_liveness_failure(now),
            FailureOutcome::Counting { consecutive: 1 }
        );
    }

    #[test]
    fn test_engage_fires_once() {
        let mut lock = SpoofLockout::default();
        let now = t0();
        let engaged = (0..25)
            .map(|_| lock.observe_liveness_failure(now))
            .filter(|o| matches!(o, FailureOutcome::Engaged { .. }))
            .count();
        assert_eq!(engaged, 1);
    }
}
