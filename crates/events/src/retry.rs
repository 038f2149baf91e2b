//! Retry budget and backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::AttemptResolution;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// base * attempt
    Linear,
    /// base * 2^(attempt - 1)
    Exponential,
}

impl core::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!(
                "unknown backoff strategy `{other}` (expected fixed, linear or exponential)"
            )),
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Dispatch attempts allowed for a new event before it is dead-lettered
    pub default_max_retries: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_max_retries: 5,
            base_delay: Duration::from_secs(5 * 60),
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            default_max_retries: max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            default_max_retries: max_retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 2_u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };

        match self.strategy {
            BackoffStrategy::Fixed => delay,
            _ => delay.min(self.max_delay),
        }
    }

    /// Whether an event that has failed `retry_count` times may run again.
    pub fn should_retry(&self, retry_count: u32, max_retries: u32) -> bool {
        retry_count < max_retries
    }

    /// Decide what a failed attempt turns into.
    ///
    /// `retry_count` is the count before this failure. The failure itself
    /// increments it; once it reaches `max_retries` the event is dead-lettered
    /// instead of rescheduled.
    pub fn resolve_failure(
        &self,
        retry_count: u32,
        max_retries: u32,
        error: String,
        now: DateTime<Utc>,
    ) -> AttemptResolution {
        let retry_count = retry_count.saturating_add(1);

        if self.should_retry(retry_count, max_retries) {
            let delay = chrono::Duration::from_std(self.delay_for_attempt(retry_count))
                .unwrap_or(chrono::Duration::MAX);
            AttemptResolution::RetryScheduled {
                retry_count,
                next_retry_at: now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
                error,
            }
        } else {
            AttemptResolution::DeadLettered { retry_count, error }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_policy_is_fixed_five_minutes() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.default_max_retries, 5);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(300));
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(
            5,
            Duration::from_millis(100),
            Duration::from_secs(10),
        );

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            default_max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn failure_schedules_retry_until_budget_is_spent() {
        let policy = RetryPolicy::fixed(2, Duration::from_secs(60));
        let now = Utc::now();

        let first = policy.resolve_failure(0, 2, "boom".to_string(), now);
        assert_eq!(
            first,
            AttemptResolution::RetryScheduled {
                retry_count: 1,
                next_retry_at: now + chrono::Duration::seconds(60),
                error: "boom".to_string(),
            }
        );

        let second = policy.resolve_failure(1, 2, "boom again".to_string(), now);
        assert_eq!(
            second,
            AttemptResolution::DeadLettered {
                retry_count: 2,
                error: "boom again".to_string(),
            }
        );
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("Exponential".parse::<BackoffStrategy>(), Ok(BackoffStrategy::Exponential));
        assert!("random".parse::<BackoffStrategy>().is_err());
    }

    proptest! {
        #[test]
        fn exactly_max_retries_failures_dead_letter(
            max_retries in 1u32..20,
            base_secs in 1u64..600,
        ) {
            let policy = RetryPolicy::fixed(max_retries, Duration::from_secs(base_secs));
            let now = Utc::now();
            let mut retry_count = 0;
            let mut attempts = 0;

            loop {
                attempts += 1;
                match policy.resolve_failure(retry_count, max_retries, "x".to_string(), now) {
                    AttemptResolution::RetryScheduled { retry_count: next, next_retry_at, .. } => {
                        prop_assert!(next_retry_at > now);
                        retry_count = next;
                    }
                    AttemptResolution::DeadLettered { retry_count: last, .. } => {
                        prop_assert_eq!(last, max_retries);
                        break;
                    }
                    AttemptResolution::Completed { .. } => unreachable!(),
                }
            }

            prop_assert_eq!(attempts, max_retries);
        }

        #[test]
        fn capped_backoff_never_exceeds_max_delay(attempt in 1u32..64) {
            let policy =
                RetryPolicy::exponential(10, Duration::from_secs(1), Duration::from_secs(900));
            prop_assert!(policy.delay_for_attempt(attempt) <= Duration::from_secs(900));
        }
    }
}
