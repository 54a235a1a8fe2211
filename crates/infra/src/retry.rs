//! Backoff for transient worker failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// base * 2^(attempt-1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// How often, and how far apart, a job is retried after a transient failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first delivery (1 = never retry).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Delay before retry number `retry` (1-indexed), capped at `max_delay`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(retry - 1).unwrap_or(u32::MAX);
                self.base_delay.checked_mul(factor).unwrap_or(self.max_delay)
            }
            BackoffStrategy::Linear => self.base_delay.checked_mul(retry).unwrap_or(self.max_delay),
        };
        delay.min(self.max_delay)
    }

    /// Whether a job that has already been retried `retries_so_far` times may go again.
    pub fn should_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far.saturating_add(1) < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_doubles_until_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            strategy: BackoffStrategy::Exponential,
        };

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(40), Duration::from_millis(500));
    }

    #[test]
    fn linear_and_fixed_backoff() {
        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 3,
        };
        assert_eq!(linear.delay_for_retry(3), Duration::from_secs(3));

        let fixed = RetryPolicy::fixed(3, Duration::from_secs(7));
        assert_eq!(fixed.delay_for_retry(1), Duration::from_secs(7));
        assert_eq!(fixed.delay_for_retry(2), Duration::from_secs(7));
    }

    #[test]
    fn should_retry_counts_the_first_delivery() {
        let policy = RetryPolicy::default().with_max_attempts(3);

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!RetryPolicy::default().with_max_attempts(1).should_retry(0));
    }

    fn any_strategy() -> impl Strategy<Value = BackoffStrategy> {
        prop_oneof![
            Just(BackoffStrategy::Fixed),
            Just(BackoffStrategy::Exponential),
            Just(BackoffStrategy::Linear),
        ]
    }

    proptest! {
        /// Property: delays never decrease between retries and never exceed the cap.
        #[test]
        fn delays_are_monotonic_and_capped(
            base_ms in 1u64..120_000,
            cap_factor in 1u32..64,
            strategy in any_strategy(),
            retry in 1u32..200,
        ) {
            let base = Duration::from_millis(base_ms);
            let policy = RetryPolicy {
                max_attempts: 10,
                base_delay: base,
                max_delay: base * cap_factor,
                strategy,
            };

            let this = policy.delay_for_retry(retry);
            let next = policy.delay_for_retry(retry + 1);
            prop_assert!(this <= next);
            prop_assert!(next <= policy.max_delay);
            prop_assert!(this >= base.min(policy.max_delay));
        }
    }
}
