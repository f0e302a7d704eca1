use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::telemetry;

/// Call budget for a rate-governed upstream resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Calls allowed to begin within any window.
    pub max_calls: usize,
    /// Length of the sliding window in milliseconds.
    pub window_ms: u64,
    /// Extra delay added after the oldest call leaves the window.
    pub safety_margin_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 5,
            window_ms: 60_000,
            safety_margin_ms: 50,
        }
    }
}

impl RateLimitConfig {
    /// Budget of `max_calls` call starts per sliding `window`, with the default safety margin.
    ///
    /// # Arguments
    ///
    /// * `max_calls` - Calls allowed to begin within any window. Zero is
    ///   treated as one by the limiter and rejected by config validation.
    /// * `window` - Length of the sliding window; truncated to whole milliseconds.
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls,
            window_ms: window.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Override the extra delay applied once the oldest call leaves the window.
    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin_ms = margin.as_millis() as u64;
        self
    }

    /// Window length as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Safety margin as a [`Duration`].
    pub fn safety_margin(&self) -> Duration {
        Duration::from_millis(self.safety_margin_ms)
    }
}

/// Bounds the rate of calls to a shared external resource.
///
/// Implementations only ever delay callers; a call is never rejected.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait for a call slot, record the call and return how long the caller
    /// was held back.
    async fn acquire(&self) -> Duration;

    /// Record a call if a slot is free right now.
    async fn try_acquire(&self) -> bool;

    /// Returns (calls in the current window, max calls).
    async fn utilization(&self) -> (usize, usize);
}

/// Sliding-window limiter keeping the start instants of recent calls.
pub struct SlidingWindowRateLimiter {
    config: RateLimitConfig,
    calls: Arc<Mutex<VecDeque<Instant>>>,
}

impl std::fmt::Debug for SlidingWindowRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("SlidingWindowRateLimiter");
        debug.field("config", &self.config);

        match self.calls.try_lock() {
            Ok(calls) => {
                debug.field("in_window", &calls.len());
            }
            Err(_) => {
                debug.field("in_window", &"<locked>");
            }
        }

        debug.finish()
    }
}

impl SlidingWindowRateLimiter {
    /// Create an empty limiter for `config`.
    ///
    /// The call log is shared by every clone of the owning `Arc`, so all
    /// stages holding it draw from one budget.
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = config.max_calls.max(1);
        Self {
            config,
            calls: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
        }
    }

    /// The budget this limiter enforces.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn max_calls(&self) -> usize {
        self.config.max_calls.max(1)
    }

    fn prune(calls: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = calls.front() {
            if now.duration_since(*oldest) >= window {
                calls.pop_front();
            } else {
                break;
            }
        }
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    async fn acquire(&self) -> Duration {
        let started = Instant::now();
        let window = self.config.window();
        let max_calls = self.max_calls();

        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                Self::prune(&mut calls, now, window);

                if calls.len() < max_calls {
                    calls.push_back(now);
                    break;
                }

                let oldest = calls.front().copied().unwrap_or(now);
                (oldest + window).saturating_duration_since(now) + self.config.safety_margin()
            };

            tracing::debug!(wait_ms = wait.as_millis() as u64, max_calls, "rate limit reached; waiting");
            tokio::time::sleep(wait).await;
        }

        let waited = started.elapsed();
        if !waited.is_zero() {
            telemetry::record_rate_limit_wait(waited);
        }
        waited
    }

    async fn try_acquire(&self) -> bool {
        let mut calls = self.calls.lock().await;
        let now = Instant::now();
        Self::prune(&mut calls, now, self.config.window());
        if calls.len() < self.max_calls() {
            calls.push_back(now);
            true
        } else {
            false
        }
    }

    async fn utilization(&self) -> (usize, usize) {
        let mut calls = self.calls.lock().await;
        Self::prune(&mut calls, Instant::now(), self.config.window());
        (calls.len(), self.max_calls())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_calls: usize, window_ms: u64) -> SlidingWindowRateLimiter {
        SlidingWindowRateLimiter::new(
            RateLimitConfig::new(max_calls, Duration::from_millis(window_ms))
                .with_safety_margin(Duration::from_millis(5)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_within_budget_do_not_wait() {
        let limiter = limiter(3, 1000);
        for _ in 0..3 {
            assert_eq!(limiter.acquire().await, Duration::ZERO);
        }
        assert_eq!(limiter.utilization().await, (3, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_oldest_to_leave_window() {
        let limiter = limiter(2, 1000);
        let start = Instant::now();

        limiter.acquire().await;
        tokio::time::advance(Duration::from_millis(300)).await;
        limiter.acquire().await;

        let waited = limiter.acquire().await;
        // oldest call at t=0 leaves the window at t=1000, plus 5ms margin
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert!(waited >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_does_not_block() {
        let limiter = limiter(1, 1000);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(limiter.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_never_exceeds_budget_in_any_window() {
        let limiter = Arc::new(limiter(3, 1000));
        let starts = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            let starts = Arc::clone(&starts);
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                starts.lock().await.push(Instant::now());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut starts = starts.lock().await.clone();
        starts.sort();
        assert_eq!(starts.len(), 10);
        for pair in starts.windows(4) {
            assert!(
                pair[3].duration_since(pair[0]) >= Duration::from_millis(1000),
                "four calls began within one window"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_calls_treated_as_one() {
        let limiter = limiter(0, 100);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
        assert_eq!(limiter.utilization().await, (1, 1));
    }
}
