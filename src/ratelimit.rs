//! Jittered backoff waits on a single-token bucket.
//!
//! A retry sequence owns one [`RateLimiter`]. The first [`wait`] creates it and
//! spends its only token; every call, the first included, then blocks until
//! the next token arrives. Later calls change the refill interval in place
//! before blocking.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::Instrument;

use crate::cancel::CancellationToken;

/// Errors from a backoff wait.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limiter wait: cancelled")]
    Cancelled,
}

impl RateLimitError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RateLimitError::Cancelled)
    }
}

/// Token bucket with a burst of one.
#[derive(Debug)]
pub struct RateLimiter {
    /// Time to refill one token. Zero means unlimited.
    interval: Duration,
    /// Current token level, between 0 and 1.
    tokens: f64,
    /// Last refill time.
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a full bucket refilling one token per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            tokens: 1.0,
            last_refill: Instant::now(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Change the refill interval. Tokens accrued so far are kept.
    pub fn set_interval(&mut self, interval: Duration) {
        self.refill(Instant::now());
        self.interval = interval;
    }

    /// Time until a token is available.
    pub fn time_until_available(&self) -> Duration {
        if self.interval.is_zero() || self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let elapsed = Instant::now().saturating_duration_since(self.last_refill);
        self.interval
            .mul_f64(1.0 - self.tokens)
            .saturating_sub(elapsed)
    }

    /// Take a token, sleeping until one is available or `cancel` fires.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        if cancel.is_cancelled() {
            return Err(RateLimitError::Cancelled);
        }

        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }

        let delay = self.time_until_available();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RateLimitError::Cancelled),
            _ = tokio::time::sleep(delay) => {
                self.tokens = 0.0;
                self.last_refill = Instant::now();
                Ok(())
            }
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.interval.is_zero() {
            self.tokens = 1.0;
        } else {
            let elapsed = now.saturating_duration_since(self.last_refill);
            let accrued = elapsed.as_secs_f64() / self.interval.as_secs_f64();
            self.tokens = (self.tokens + accrued).min(1.0);
        }
        self.last_refill = now;
    }
}

/// A random duration in `[min, max]` scaled by `attempt`, at millisecond
/// granularity.
///
/// Callers must pass `attempt >= 1` and `max >= min`.
pub fn generate_backoff(attempt: u32, min: Duration, max: Duration) -> Duration {
    let min_ms = min.as_millis() as u64;
    let delta = (max.as_millis() as u64).saturating_sub(min_ms);
    let jitter = if delta == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..delta)
    };
    Duration::from_millis((min_ms + jitter) * u64::from(attempt))
}

/// Wait out the backoff for `attempt`, creating the limiter on first use.
///
/// A new limiter is primed by spending its token, so the wait that follows
/// blocks for a full interval. An existing limiter gets a fresh interval and
/// blocks until its next token. On error the limiter is dropped; the next
/// call starts over with a new one.
pub async fn wait(
    attempt: u32,
    min: Duration,
    max: Duration,
    limiter: Option<RateLimiter>,
    cancel: &CancellationToken,
) -> Result<RateLimiter, RateLimitError> {
    let span = tracing::debug_span!(
        "rate-limiter-wait",
        try_count = attempt,
        min_duration_ms = min.as_millis() as u64,
        max_duration_ms = max.as_millis() as u64,
        backoff_ms = tracing::field::Empty,
    );

    async move {
        let backoff = generate_backoff(attempt, min, max);
        tracing::Span::current().record("backoff_ms", backoff.as_millis() as u64);

        let mut limiter = match limiter {
            Some(mut limiter) => {
                limiter.set_interval(backoff);
                limiter
            }
            None => {
                let mut limiter = RateLimiter::new(backoff);
                limiter.wait(cancel).await?;
                limiter
            }
        };
        limiter.wait(cancel).await?;
        Ok(limiter)
    }
    .instrument(span)
    .await
}
