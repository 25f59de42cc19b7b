//! Retry policies and per-message retry counters
//!
//! Every transport consults the same [`RetryPolicy`] after a failed
//! delivery; only the redelivery mechanism differs per broker.

use crate::config::{MqConfig, RetryStrategy};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Decides how long to wait before the next attempt and when to give up
pub trait RetryPolicy: Send + Sync {
    /// Delay before redelivering after the `attempt`-th failure (1-based)
    fn next_delay(&self, attempt: u32) -> Duration;

    /// Failures tolerated before the message is dead-lettered
    fn max_attempts(&self) -> u32;
}

/// `attempt * step`, capped at `max`
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    step: Duration,
    max: Duration,
    max_attempts: u32,
}

impl LinearBackoff {
    pub fn new(step: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            step,
            max,
            max_attempts,
        }
    }
}

impl RetryPolicy for LinearBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.max)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// `base * 2^(attempt - 1)`, capped at `max`: 1s, 2s, 4s, 8s, ...
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Build the policy described by the configuration
pub fn policy_from_config(config: &MqConfig) -> Arc<dyn RetryPolicy> {
    let retry = &config.retry;
    match retry.strategy {
        RetryStrategy::Linear => Arc::new(LinearBackoff::new(
            retry.base_delay(),
            retry.max_delay(),
            config.max_retries,
        )),
        RetryStrategy::Exponential => Arc::new(ExponentialBackoff::new(
            retry.base_delay(),
            retry.max_delay(),
            config.max_retries,
        )),
    }
}

/// Failure counters keyed by message id
///
/// A counter is cleared once the message succeeds, is dead-lettered or
/// will not be redelivered by this process.
#[derive(Debug, Default)]
pub struct RetryTracker {
    counts: DashMap<String, u32>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more failure and return the updated count
    pub fn record_failure(&self, message_id: &str) -> u32 {
        let mut count = self.counts.entry(message_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn count(&self, message_id: &str) -> u32 {
        self.counts.get(message_id).map(|c| *c).unwrap_or(0)
    }

    pub fn clear(&self, message_id: &str) {
        self.counts.remove(message_id);
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff() {
        let policy = LinearBackoff::new(Duration::from_secs(1), Duration::from_secs(5), 3);
        assert_eq!(policy.next_delay(1), Duration::from_secs(1));
        assert_eq!(policy.next_delay(2), Duration::from_secs(2));
        assert_eq!(policy.next_delay(9), Duration::from_secs(5));
        assert_eq!(policy.max_attempts(), 3);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10), 5);
        assert_eq!(policy.next_delay(1), Duration::from_secs(1));
        assert_eq!(policy.next_delay(2), Duration::from_secs(2));
        assert_eq!(policy.next_delay(3), Duration::from_secs(4));
        assert_eq!(policy.next_delay(4), Duration::from_secs(8));
        assert_eq!(policy.next_delay(5), Duration::from_secs(10));
        // no overflow on absurd attempts
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = MqConfig::memory();
        config.max_retries = 7;
        config.retry.strategy = RetryStrategy::Exponential;
        config.retry.base_delay_ms = 100;
        let policy = policy_from_config(&config);
        assert_eq!(policy.max_attempts(), 7);
        assert_eq!(policy.next_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_tracker_counts_until_cleared() {
        let tracker = RetryTracker::new();
        assert_eq!(tracker.record_failure("m1"), 1);
        assert_eq!(tracker.record_failure("m1"), 2);
        assert_eq!(tracker.record_failure("m2"), 1);
        assert_eq!(tracker.count("m1"), 2);

        tracker.clear("m1");
        assert_eq!(tracker.count("m1"), 0);
        assert_eq!(tracker.len(), 1);
    }
}
