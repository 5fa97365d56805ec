//! Retry and quarantine policy for failed reports.
//!
//! A failed report is retried after a fixed pause until the store says it
//! has been delivered more than `max_attempts` times; the failure after that
//! quarantines it. With the default of 15, the 16th failed delivery is the
//! last one.

use std::time::Duration;

/// When to retry a failed report and when to give up on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deliveries after which a failure quarantines the report.
    pub max_attempts: i64,

    /// Pause after a failed attempt or a failed fetch.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Policy for production draining.
    ///
    /// - quarantine on the 16th failed delivery
    /// - 5s between attempts, so a report is given up on after ~75s of
    ///   failures
    pub const DEFAULT: Self = Self {
        max_attempts: 15,
        backoff: Duration::from_secs(5),
    };

    /// Creates a new retry policy.
    pub fn new(max_attempts: i64, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Whether a report delivered `attempts` times should be quarantined
    /// after failing again.
    pub fn should_quarantine(&self, attempts: i64) -> bool {
        attempts > self.max_attempts
    }

    /// Upper bound on time spent retrying one report before it is
    /// quarantined, ignoring processing time.
    pub fn total_max_wait(&self) -> Duration {
        let retries = u32::try_from(self.max_attempts.max(0)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(retries)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_constant() {
        assert_eq!(RetryPolicy::default(), RetryPolicy::DEFAULT);
        assert_eq!(RetryPolicy::DEFAULT.max_attempts, 15);
        assert_eq!(RetryPolicy::DEFAULT.backoff, Duration::from_secs(5));
    }

    #[test]
    fn quarantines_only_past_the_limit() {
        let policy = RetryPolicy::DEFAULT;
        assert!(!policy.should_quarantine(0));
        assert!(!policy.should_quarantine(1));
        assert!(!policy.should_quarantine(15));
        assert!(policy.should_quarantine(16));
        assert!(policy.should_quarantine(i64::MAX));
    }

    #[test]
    fn zero_attempts_quarantines_after_first_failure() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert!(policy.should_quarantine(1));
    }

    #[test]
    fn total_max_wait() {
        assert_eq!(RetryPolicy::DEFAULT.total_max_wait(), Duration::from_secs(75));
        assert_eq!(
            RetryPolicy::new(-3, Duration::from_secs(5)).total_max_wait(),
            Duration::ZERO
        );
    }
}
