//! Retry and backoff policies.
//!
//! Two policies live here:
//!
//! - [`RetryPolicy`]: bounded exponential backoff used for job-result
//!   delivery, terminal acknowledgements, spool shipping, and worker
//!   restarts.
//! - [`heartbeat_interval_seconds`]: the doubling schedule applied to the
//!   heartbeat cadence after consecutive failures.

use std::time::Duration;

/// Bounded exponential backoff: `base`, `base*factor`, ... capped at
/// `cap`, for at most `max_attempts` attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base: Duration,
    /// Multiplier applied per retry.
    pub factor: u32,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Total number of attempts (first try included).
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay to apply after the given failed attempt (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_possible_wrap)] // attempt count stays far below i32::MAX
        let exponent = attempt.saturating_sub(1).min(1024) as i32;
        let delay_secs = self.base.as_secs_f64() * f64::from(self.factor).powi(exponent);
        Duration::from_secs_f64(delay_secs.min(self.cap.as_secs_f64()))
    }

    /// Run `operation` until it succeeds or attempts are exhausted,
    /// sleeping the scheduled delay between attempts. Returns the last
    /// error when every attempt fails.
    ///
    /// # Errors
    ///
    /// Propagates the final error from `operation`.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(attempt, delay_s = delay.as_secs(), %error, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(error) => return Err(error),
            }
        }
    }
}

/// Compute the heartbeat interval after `failure_count` consecutive
/// failures.
///
/// A non-positive base falls back to 30 seconds. The result doubles per
/// failure and never exceeds `max_interval_seconds`; it is monotone
/// non-decreasing in `failure_count`.
#[must_use]
pub fn heartbeat_interval_seconds(
    base_interval_seconds: i64,
    failure_count: i64,
    max_interval_seconds: i64,
) -> i64 {
    if base_interval_seconds <= 0 {
        return 30;
    }
    if failure_count <= 0 {
        return base_interval_seconds;
    }
    let mut interval = base_interval_seconds;
    for _ in 0..failure_count {
        interval = interval.saturating_mul(2);
        if interval >= max_interval_seconds {
            return max_interval_seconds;
        }
    }
    interval.min(max_interval_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(16));
        // Cap applies from attempt 7 onwards.
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_until_success() {
        let policy = RetryPolicy::default();
        let mut remaining_failures = 3;
        let result: Result<u32, &str> = policy
            .run(|| {
                let fail = remaining_failures > 0;
                remaining_failures -= i32::from(fail);
                async move { if fail { Err("transient") } else { Ok(7) } }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exhausts_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let mut calls = 0;
        let result: Result<(), &str> = policy
            .run(|| {
                calls += 1;
                async { Err("down") }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_heartbeat_interval_doubling() {
        // base=45, cap=300: failures 0..5 give 45, 90, 180, 300, 300, 300.
        let expected = [45, 90, 180, 300, 300, 300];
        for (failures, want) in expected.iter().enumerate() {
            assert_eq!(
                heartbeat_interval_seconds(45, failures as i64, 300),
                *want,
                "failures={failures}"
            );
        }
    }

    #[test]
    fn test_heartbeat_interval_non_positive_base() {
        assert_eq!(heartbeat_interval_seconds(0, 3, 300), 30);
        assert_eq!(heartbeat_interval_seconds(-5, 0, 300), 30);
    }

    #[test]
    fn test_heartbeat_interval_monotone_and_capped() {
        let mut previous = 0;
        for failures in 0..64 {
            let interval = heartbeat_interval_seconds(45, failures, 300);
            assert!(interval >= previous);
            assert!(interval <= 300);
            previous = interval;
        }
    }
}
