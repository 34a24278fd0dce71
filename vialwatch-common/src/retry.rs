//! Bounded polling waits
//!
//! The relay and its clients wait on files written by the analysis program
//! on its own schedule. Every such wait goes through one `RetryPolicy` so the
//! interval, attempt budget and backoff are configured in one place.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};

/// Interval, attempt budget and optional exponential backoff for a wait
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub interval_ms: u64,
    /// Total number of attempts, including the first
    pub max_attempts: u32,
    /// Delay multiplier applied after each failed attempt (1.0 = fixed)
    #[serde(default = "default_backoff")]
    pub backoff: f64,
    /// Upper bound for the delay when backing off
    #[serde(default)]
    pub max_interval_ms: Option<u64>,
}

fn default_backoff() -> f64 {
    1.0
}

impl RetryPolicy {
    /// Fixed-interval policy
    pub const fn fixed(interval_ms: u64, max_attempts: u32) -> Self {
        Self {
            interval_ms,
            max_attempts,
            backoff: 1.0,
            max_interval_ms: None,
        }
    }

    /// Wait for a rotated log file to appear: 20 × 500ms
    pub const fn log_discovery() -> Self {
        Self::fixed(500, 20)
    }

    /// Wait for the volume result file: 10 × 1s
    pub const fn volume_result() -> Self {
        Self::fixed(1000, 10)
    }

    /// Delay to sleep after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = if self.backoff > 1.0 {
            self.backoff.powi(attempt.saturating_sub(1) as i32)
        } else {
            1.0
        };
        let mut millis = (self.interval_ms as f64 * factor).round() as u64;
        if let Some(cap) = self.max_interval_ms {
            millis = millis.min(cap);
        }
        Duration::from_millis(millis)
    }

    /// Sum of all delays if every attempt fails
    pub fn total_budget(&self) -> Duration {
        (1..self.max_attempts.max(1))
            .map(|attempt| self.delay_after(attempt))
            .sum()
    }

    /// Run `check` until it yields `Some`, sleeping between attempts.
    ///
    /// Returns `None` once the attempt budget is spent. No sleep happens after
    /// the final attempt.
    pub async fn poll<F, Fut, T>(&self, operation_name: &str, mut check: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let start_time = Instant::now();
        let max_attempts = self.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if let Some(value) = check().await {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Wait satisfied after retry"
                    );
                }
                return Some(value);
            }

            if attempt == max_attempts {
                break;
            }

            let delay = self.delay_after(attempt);
            tracing::debug!(
                operation = operation_name,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Not ready yet, waiting"
            );
            tokio::time::sleep(delay).await;
        }

        tracing::warn!(
            operation = operation_name,
            attempts = max_attempts,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "Retry budget exhausted"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_poll_succeeds_first_attempt() {
        let policy = RetryPolicy::fixed(1, 3);
        let result = policy.poll("test_op", || async { Some(42) }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_poll_succeeds_after_retries() {
        let policy = RetryPolicy::fixed(1, 5);
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result = policy
            .poll("test_op", move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    (n >= 3).then_some(n)
                }
            })
            .await;

        assert_eq!(result, Some(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_gives_up_after_max_attempts() {
        let policy = RetryPolicy::fixed(1, 4);
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: Option<()> = policy
            .poll("test_op", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    None
                }
            })
            .await;

        assert!(result.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_fixed_policy_budget() {
        assert_eq!(RetryPolicy::log_discovery().total_budget(), Duration::from_millis(9500));
        assert_eq!(RetryPolicy::volume_result().total_budget(), Duration::from_secs(9));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            interval_ms: 100,
            max_attempts: 10,
            backoff: 2.0,
            max_interval_ms: Some(500),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(4), Duration::from_millis(500));
    }
}
