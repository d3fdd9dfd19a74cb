use std::time::Duration;

/// Timeout used to pause a partition until it is explicitly resumed
pub const PAUSE_FOREVER: Duration = Duration::from_millis(1_000_000_000_000);

/// How long a pause lasts before the partition resumes on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseTimeout {
    Finite(Duration),
    Forever,
}

impl PauseTimeout {
    /// Zero and anything at or beyond [`PAUSE_FOREVER`] mean "until resumed"
    pub fn from_duration(timeout: Duration) -> Self {
        if timeout.is_zero() || timeout >= PAUSE_FOREVER {
            PauseTimeout::Forever
        } else {
            PauseTimeout::Finite(timeout)
        }
    }
}

/// Computes pause timeouts from the number of consecutive pauses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    exponential: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1_000), Duration::from_millis(30_000), true)
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, exponential: bool) -> Self {
        Self {
            base,
            max,
            exponential,
        }
    }

    /// Timeout for a pause preceded by `attempt` consecutive pauses.
    ///
    /// Exponential: `min(base * 2^attempt, max)`. Otherwise always `base`.
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return self.base;
        }

        match 2u32.checked_pow(attempt) {
            Some(factor) => self.base.saturating_mul(factor).min(self.max),
            None => self.max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 500)]
    #[case(1, 1_000)]
    #[case(2, 2_000)]
    #[case(3, 4_000)]
    #[case(4, 8_000)]
    #[case(5, 10_000)]
    #[case(40, 10_000)]
    fn test_exponential_backoff_is_capped(#[case] attempt: u32, #[case] expected_ms: u64) {
        let policy = BackoffPolicy::new(
            Duration::from_millis(500),
            Duration::from_millis(10_000),
            true,
        );

        assert_eq!(
            policy.timeout_for(attempt),
            Duration::from_millis(expected_ms)
        );
    }

    #[rstest]
    #[case(0)]
    #[case(3)]
    #[case(100)]
    fn test_constant_backoff_ignores_attempts(#[case] attempt: u32) {
        let policy = BackoffPolicy::new(
            Duration::from_millis(20_000),
            Duration::from_millis(60_000),
            false,
        );

        assert_eq!(policy.timeout_for(attempt), Duration::from_millis(20_000));
    }

    #[test]
    fn test_exponential_backoff_is_monotonic() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), true);

        let timeouts: Vec<Duration> = (0..10).map(|a| policy.timeout_for(a)).collect();
        assert!(timeouts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(timeouts.last(), Some(&Duration::from_secs(30)));
    }

    #[test]
    fn test_pause_timeout_sentinels() {
        assert_eq!(
            PauseTimeout::from_duration(Duration::ZERO),
            PauseTimeout::Forever
        );
        assert_eq!(
            PauseTimeout::from_duration(PAUSE_FOREVER),
            PauseTimeout::Forever
        );
        assert_eq!(
            PauseTimeout::from_duration(Duration::from_millis(250)),
            PauseTimeout::Finite(Duration::from_millis(250))
        );
    }
}
