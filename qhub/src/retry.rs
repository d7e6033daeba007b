//! Retry policy with exponential backoff.
//!
//! One policy type is shared by transient stage failures and session
//! provisioning. The delay before retry `n` (0-indexed) is
//! `initial_delay * backoff_multiplier^n`, capped at `max_delay`, with
//! optional jitter.

use crate::cancellation::CancellationToken;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// Bounded retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied per retry.
    pub backoff_multiplier: f64,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
    /// Jitter applied to each delay.
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: JitterStrategy::None,
        }
    }
}

/// Result of running an operation under a policy.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Final result.
    pub result: Result<T, E>,
    /// Attempts made, including the first.
    pub attempts: u32,
}

impl RetryPolicy {
    /// Creates a policy with `max_retries` and default delays.
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::new(0)
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts allowed, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (0-indexed).
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64;
        let factor = self.backoff_multiplier.max(1.0).powi(retry as i32);
        let max = self.max_delay.as_millis() as f64;
        let delay = (base * factor).min(max).max(0.0) as u64;

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };
        Duration::from_millis(jittered)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempts are exhausted.
    ///
    /// `operation` receives the 0-indexed attempt number.
    pub async fn execute<T, E, F, Fut, P>(
        &self,
        key: &str,
        is_retryable: P,
        operation: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        self.run(key, None, is_retryable, operation).await
    }

    /// Like [`execute`](Self::execute), but stops retrying once `token` is
    /// cancelled, including while sleeping between attempts.
    pub async fn execute_cancellable<T, E, F, Fut, P>(
        &self,
        key: &str,
        token: &CancellationToken,
        is_retryable: P,
        operation: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        self.run(key, Some(token), is_retryable, operation).await
    }

    async fn run<T, E, F, Fut, P>(
        &self,
        key: &str,
        token: Option<&CancellationToken>,
        is_retryable: P,
        mut operation: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            let result = operation(attempt).await;
            let attempts = attempt + 1;
            let err = match result {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    }
                }
                Err(e) => e,
            };

            let cancelled = token.is_some_and(CancellationToken::is_cancelled);
            if attempt >= self.max_retries || cancelled || !is_retryable(&err) {
                return RetryOutcome {
                    result: Err(err),
                    attempts,
                };
            }

            let delay = self.delay_for(attempt);
            tracing::debug!(
                key,
                attempt = attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Retrying after error"
            );

            match token {
                Some(token) => {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = token.cancelled() => {
                            return RetryOutcome { result: Err(err), attempts };
                        }
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_is_exponential() {
        let policy = RetryPolicy::new(3).with_initial_delay(Duration::from_millis(100));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy::new(20)
            .with_initial_delay(Duration::from_millis(1000))
            .with_max_delay(Duration::from_millis(5000));
        assert_eq!(policy.delay_for(10), Duration::from_millis(5000));
    }

    #[test]
    fn test_full_jitter_bounded() {
        let policy = RetryPolicy::new(1)
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(JitterStrategy::Full);
        for _ in 0..10 {
            assert!(policy.delay_for(0) <= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_success_after_failures() {
        let policy = RetryPolicy::new(3).with_initial_delay(Duration::from_millis(1));
        let outcome = policy
            .execute("op", |_: &String| true, |attempt| async move {
                if attempt < 2 {
                    Err(format!("attempt {attempt}"))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(outcome.result, Ok(42));
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts() {
        let policy = RetryPolicy::new(2).with_initial_delay(Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let outcome: RetryOutcome<(), String> = policy
            .execute("op", |_| true, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("always fails".to_string())
                }
            })
            .await;
        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let policy = RetryPolicy::new(5).with_initial_delay(Duration::from_millis(1));
        let outcome: RetryOutcome<(), &str> = policy
            .execute("op", |e: &&str| *e != "fatal", |_| async { Err("fatal") })
            .await;
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts() {
        let policy = RetryPolicy::new(3).with_initial_delay(Duration::from_millis(100));
        let start = tokio::time::Instant::now();
        let outcome: RetryOutcome<(), &str> =
            policy.execute("op", |_| true, |_| async { Err("down") }).await;
        assert_eq!(outcome.attempts, 4);
        // 100 + 200 + 400
        assert_eq!(start.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let policy = RetryPolicy::new(3).with_initial_delay(Duration::from_secs(30));
        let token = Arc::new(CancellationToken::new());
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel("stop");
            })
        };
        let outcome: RetryOutcome<(), &str> = tokio::time::timeout(
            Duration::from_secs(5),
            policy.execute_cancellable("op", &token, |_| true, |_| async { Err("down") }),
        )
        .await
        .unwrap();
        canceller.await.unwrap();
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.result.is_err());
    }
}
