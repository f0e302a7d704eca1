use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry and backoff behaviour for transient stage failures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single backoff delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Smallest total delay the policy will sleep across `retries` retries.
    pub fn minimum_total_backoff(&self, retries: u32) -> Duration {
        (1..=retries).map(|n| compute_backoff(n, self)).sum()
    }
}

/// Computes the delay before retry number `retry` (1-based).
///
/// Formula: delay = min(base_delay * 2^(retry-1), max_delay)
pub fn compute_backoff(retry: u32, policy: &RetryPolicy) -> Duration {
    if retry == 0 {
        return Duration::ZERO;
    }

    let exp = retry.saturating_sub(1).min(63);
    let scaled = policy
        .base_delay_ms
        .saturating_mul(2u64.saturating_pow(exp));
    Duration::from_millis(scaled.min(policy.max_delay_ms))
}

/// True when another attempt is allowed after `attempts` have been made.
pub fn should_retry(attempts: u32, max_attempts: u32) -> bool {
    attempts < max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_backoff_exponential() {
        let policy = RetryPolicy::default();

        assert_eq!(compute_backoff(0, &policy), Duration::ZERO);
        assert_eq!(
            compute_backoff(1, &policy),
            Duration::from_millis(policy.base_delay_ms)
        );
        assert_eq!(
            compute_backoff(2, &policy),
            Duration::from_millis(policy.base_delay_ms * 2)
        );
        assert_eq!(
            compute_backoff(3, &policy),
            Duration::from_millis(policy.base_delay_ms * 4)
        );
    }

    #[test]
    fn test_backoff_capped() {
        let policy = RetryPolicy::new(10, 1000, 5000);
        assert_eq!(compute_backoff(10, &policy), Duration::from_millis(5000));
        // no overflow for absurd retry numbers
        assert_eq!(compute_backoff(u32::MAX, &policy), Duration::from_millis(5000));
    }

    #[test]
    fn test_should_retry() {
        assert!(should_retry(0, 3));
        assert!(should_retry(2, 3));
        assert!(!should_retry(3, 3));
        assert!(!should_retry(1, 1));
    }

    #[test]
    fn test_minimum_total_backoff() {
        let policy = RetryPolicy::new(3, 100, 10_000);
        assert_eq!(policy.minimum_total_backoff(2), Duration::from_millis(300));
        assert_eq!(policy.minimum_total_backoff(0), Duration::ZERO);
    }
}
