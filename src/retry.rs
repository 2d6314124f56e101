//! Retry with jittered, escalating backoff.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::cancel::CancellationToken;
use crate::error::{AttemptError, RetryError};
use crate::ratelimit::{self, RateLimiter};

/// When and how often to retry an operation.
pub struct RetryPolicy<E> {
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    max_attempts: u32,
    min_backoff: Duration,
    max_backoff: Duration,
}

impl<E> RetryPolicy<E> {
    /// Retry errors accepted by `should_retry`, three attempts, backoff
    /// between 100ms and 1s per attempt.
    pub fn new<F>(should_retry: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self {
            should_retry: Arc::new(should_retry),
            max_attempts: 3,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }

    /// Total number of attempts, including the first. At least one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Bounds of the per-attempt backoff before scaling by attempt number.
    /// Reversed bounds are swapped.
    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = min.min(max);
        self.max_backoff = max.max(min);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn min_backoff(&self) -> Duration {
        self.min_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn should_retry(&self, err: &E) -> bool {
        (self.should_retry)(err)
    }
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            should_retry: Arc::clone(&self.should_retry),
            max_attempts: self.max_attempts,
            min_backoff: self.min_backoff,
            max_backoff: self.max_backoff,
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("min_backoff", &self.min_backoff)
            .field("max_backoff", &self.max_backoff)
            .finish_non_exhaustive()
    }
}

/// Run `operation` until it succeeds, fails with an error the policy will not
/// retry, or runs out of attempts.
///
/// Each attempt gets a clone of `cancel`. A rejected error is returned as
/// [`RetryError::Rejected`] without attempt context. Retryable failures are
/// annotated with their attempt number, and between attempts the call backs
/// off through a [`RateLimiter`] shared by the whole sequence.
///
/// A failed backoff wait, including one interrupted by `cancel`, does not end
/// the sequence: the next attempt starts immediately. Operations are expected
/// to observe the token themselves.
pub async fn execute<R, E, F, Fut>(
    mut operation: F,
    policy: &RetryPolicy<E>,
    cancel: &CancellationToken,
) -> Result<R, RetryError<E>>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: fmt::Display,
{
    let max_tries = policy.max_attempts.max(1);
    let mut limiter: Option<RateLimiter> = None;
    let mut attempt = 1;

    loop {
        let span = tracing::info_span!("try", try_count = attempt, max_tries);
        let err = match operation(cancel.clone()).instrument(span).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !policy.should_retry(&err) {
            return Err(RetryError::Rejected(err));
        }

        let err = AttemptError {
            attempt,
            max_tries,
            source: err,
        };
        tracing::info!(try_count = attempt, max_tries, "{err}");

        if attempt == max_tries {
            return Err(RetryError::Exhausted {
                max_tries,
                last: err,
            });
        }

        match ratelimit::wait(
            attempt,
            policy.min_backoff,
            policy.max_backoff,
            limiter.take(),
            cancel,
        )
        .await
        {
            Ok(reused) => limiter = Some(reused),
            Err(wait_err) => tracing::info!(try_count = attempt, "rate limit: {wait_err}"),
        }

        attempt += 1;
    }
}
