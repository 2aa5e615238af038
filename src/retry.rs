//! Retry policy for fallible async operations.
//!
//! Semantics:
//! - `max_retries` counts additional attempts, so an operation runs at most
//!   `max_retries + 1` times.
//! - The `should_retry` predicate decides whether a failure is retryable; a
//!   non-retryable failure is returned immediately as `RetryError::Aborted`.
//! - The delay before retry `n` (1-indexed) is
//!   `min(max_delay, initial_delay * 2^(n-1) * uniform(0.5, 1.0))`.
//! - Delays are waited out through a [`Sleeper`]. Production uses the tokio
//!   timer; tests plug in one that records the delay and returns at once.
//!
//! ```rust
//! use std::time::Duration;
//! use tixgate::{RetryError, RetryPolicy};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let policy = RetryPolicy::<std::io::Error>::builder()
//!     .max_retries(2)
//!     .initial_delay(Duration::from_millis(2))
//!     .build()
//!     .unwrap();
//! let result: Result<(), _> = policy
//!     .execute(|| async { Err(std::io::Error::other("down")) })
//!     .await;
//! assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
//! # });
//! ```

use crate::error::{RetryError, MAX_RETRY_FAILURES};
use crate::{Backoff, Jitter};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Waits out the backoff between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

/// Backoff on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Upper bound accepted for `max_retries`.
pub const MAX_RETRIES_LIMIT: usize = 100;

/// Retry policy combining backoff, jitter, predicate, and sleeper.
pub struct RetryPolicy<E> {
    max_retries: usize,
    backoff: Backoff,
    max_delay: Duration,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_retries: self.max_retries,
            backoff: self.backoff,
            max_delay: self.max_delay,
            jitter: self.jitter,
            should_retry: Arc::clone(&self.should_retry),
            sleeper: Arc::clone(&self.sleeper),
        }
    }
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("sleeper", &self.sleeper)
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::fmt::Display + Send + 'static,
{
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Total attempts the policy allows, initial call included.
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Jittered, capped delay before retry `attempt` (1-indexed).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        self.jitter.apply(self.backoff.delay(attempt)).min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails non-retryably, or runs out of attempts.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, RetryError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        let max_attempts = self.max_attempts();
        let mut failures: Vec<E> = Vec::new();

        for attempt in 1..=max_attempts {
            tracing::debug!(attempt, max_attempts, "attempt starting");
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !(self.should_retry)(&err) {
                tracing::debug!(attempt, error = %err, "failure is not retryable");
                return Err(RetryError::Aborted(err));
            }

            if attempt == max_attempts {
                tracing::error!(attempts = attempt, error = %err, "retries exhausted");
                failures.push(err);
                return Err(RetryError::exhausted(attempt, failures));
            }

            let delay = self.delay_for(attempt);
            tracing::warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, backing off"
            );
            failures.push(err);
            if failures.len() > MAX_RETRY_FAILURES {
                failures.remove(0);
            }
            self.sleeper.sleep(delay).await;
        }

        Err(RetryError::exhausted(max_attempts, failures))
    }
}

/// Builder for `RetryPolicy`.
pub struct RetryPolicyBuilder<E> {
    max_retries: usize,
    initial_delay: Duration,
    max_delay: Duration,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("max_retries must be <= {MAX_RETRIES_LIMIT} (got {0})")]
    TooManyRetries(usize),
    #[error("initial_delay ({initial:?}) must not exceed max_delay ({max:?})")]
    InitialExceedsMax { initial: Duration, max: Duration },
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::fmt::Display + Send + 'static,
{
    /// Builder preloaded with the gateway's upstream defaults: 5 retries, 3s initial, 20s cap.
    pub fn new() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(3000),
            max_delay: Duration::from_millis(20_000),
            jitter: Jitter::Multiplicative,
            should_retry: Arc::new(|_| true),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Additional attempts after the first.
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Predicate deciding whether a failure is worth another attempt.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Share an already type-erased sleeper.
    pub fn with_shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Build the retry policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy<E>, BuildError> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(BuildError::TooManyRetries(self.max_retries));
        }
        if self.initial_delay > self.max_delay {
            return Err(BuildError::InitialExceedsMax {
                initial: self.initial_delay,
                max: self.max_delay,
            });
        }
        Ok(RetryPolicy {
            max_retries: self.max_retries,
            backoff: Backoff::exponential(self.initial_delay),
            max_delay: self.max_delay,
            jitter: self.jitter,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::fmt::Display + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
