//! Cancellable retry with exponential backoff and jitter
//!
//! Every error is treated as retryable. Callers that need selective retry
//! should classify errors before handing the operation to the policy.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry failure, distinguishing cancellation points from exhaustion
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("{operation}: cancelled before attempt {attempt}")]
    CancelledBeforeAttempt { operation: String, attempt: u32 },

    #[error("{operation}: cancelled during backoff after attempt {attempt}: {last}")]
    CancelledDuringBackoff {
        operation: String,
        attempt: u32,
        #[source]
        last: E,
    },

    #[error("{operation}: failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        last: E,
    },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// Last failure of the wrapped operation, if it ran at all
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::CancelledBeforeAttempt { .. } => None,
            RetryError::CancelledDuringBackoff { last, .. } | RetryError::Exhausted { last, .. } => {
                Some(last)
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        !matches!(self, RetryError::Exhausted { .. })
    }
}

/// Exponential backoff policy
///
/// Fields are private; derive variants with the `with_*` builders.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    max_attempts: u32,
    #[serde(rename = "initial_delay_ms", with = "millis")]
    initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "millis")]
    max_delay: Duration,
    backoff_factor: f64,
    jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_factor: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_factor,
            jitter_factor,
        }
    }

    /// Policy used for SSH dials: more patience for freshly booted nodes
    pub fn ssh() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_factor: 0.2,
        }
    }

    /// A single attempt, no delay
    pub fn once() -> Self {
        Self::default().with_max_attempts(1)
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self { max_attempts, ..self }
    }

    pub fn with_initial_delay(self, initial_delay: Duration) -> Self {
        Self { initial_delay, ..self }
    }

    pub fn with_max_delay(self, max_delay: Duration) -> Self {
        Self { max_delay, ..self }
    }

    pub fn with_backoff_factor(self, backoff_factor: f64) -> Self {
        Self { backoff_factor, ..self }
    }

    pub fn with_jitter_factor(self, jitter_factor: f64) -> Self {
        Self { jitter_factor, ..self }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }

    /// Delay after growing `current` by the backoff factor, capped at max delay
    pub fn next_delay(&self, current: Duration) -> Duration {
        let grown = current.as_secs_f64() * self.backoff_factor.max(1.0);
        Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()))
    }

    /// `delay ± delay * jitter_factor * U(-1, 1)`, never negative
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let spread: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        let jitter = delay.as_secs_f64() * self.jitter_factor * spread;
        Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
    }

    /// Run `op` until it succeeds, attempts run out, or `cancel` fires.
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn execute<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut delay = self.initial_delay;
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::CancelledBeforeAttempt {
                    operation: operation.to_string(),
                    attempt,
                });
            }

            let err = match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if attempt >= max_attempts {
                warn!("{} failed after {} attempts: {}", operation, attempt, err);
                return Err(RetryError::Exhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last: err,
                });
            }

            let wait = self.jittered(delay);
            debug!(
                "{} attempt {}/{} failed: {}; retrying in {:?}",
                operation, attempt, max_attempts, err, wait
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryError::CancelledDuringBackoff {
                        operation: operation.to_string(),
                        attempt,
                        last: err,
                    });
                }
                _ = tokio::time::sleep(wait) => {}
            }

            delay = self.next_delay(delay);
            attempt += 1;
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Error)]
    #[error("boom on attempt {0}")]
    struct Boom(u32);

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_jitter_factor(0.0)
    }

    #[tokio::test]
    async fn test_exhaustion_makes_exact_attempts() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), _> = fast_policy(3)
            .execute(&cancel, "always-fails", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(Boom(attempt)) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let err = result.unwrap_err();
        assert!(err.to_string().contains('3'));
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert_eq!(err.last_error().map(|b| b.0), Some(3));
    }

    #[tokio::test]
    async fn test_success_after_failure() {
        let cancel = CancellationToken::new();
        let value = fast_policy(3)
            .execute(&cancel, "flaky", |attempt| async move {
                if attempt < 2 {
                    Err(Boom(attempt))
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn test_single_attempt_has_no_delay() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::once().with_initial_delay(Duration::from_secs(60));
        let start = std::time::Instant::now();

        let result: Result<(), _> = policy
            .execute(&cancel, "once", |attempt| async move { Err(Boom(attempt)) })
            .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), RetryError<Boom>> = fast_policy(3)
            .execute(&cancel, "never-runs", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::CancelledBeforeAttempt { attempt: 1, .. }));
        assert!(err.to_string().contains("cancelled before attempt"));
    }

    #[tokio::test]
    async fn test_cancelled_during_backoff() {
        let cancel = CancellationToken::new();
        let policy = fast_policy(5).with_initial_delay(Duration::from_secs(30));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: Result<(), _> = policy
            .execute(&cancel, "slow", |attempt| async move { Err(Boom(attempt)) })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::CancelledDuringBackoff { attempt: 1, .. }));
        assert!(err.to_string().contains("cancelled during backoff"));
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_next_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(policy.next_delay(Duration::from_secs(20)), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::default().with_jitter_factor(0.5);
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let d = policy.jittered(base);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_overrides_leave_original_untouched() {
        let base = RetryPolicy::default();
        let derived = base.with_max_attempts(7);
        assert_eq!(base.max_attempts(), 3);
        assert_eq!(derived.max_attempts(), 7);
        assert_eq!(derived.initial_delay(), base.initial_delay());
    }
}
