//! Retry with exponential backoff and per-attempt deadlines.
//!
//! Every external call (embedding, completion) goes through
//! [`RetryPolicy::run`]. Each attempt is bounded by its own deadline; an
//! attempt that overruns it fails with [`ProviderError::Timeout`], which is
//! retryable. Errors the policy's predicate rejects return immediately; the
//! default predicate is [`ProviderError::is_retryable`].
//!
//! Delay before attempt `n` (1-based, `n >= 2`):
//!
//! ```text
//! cap   = min(max_delay, base_delay * 2^(n-2))
//! delay = jitter ? uniform(0, cap) : cap
//! ```

use std::future::Future;
use std::time::Duration;

use knowbridge_core::error::ProviderError;
use rand::Rng;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Full jitter: sleep a uniform random fraction of the backoff cap.
    pub jitter: bool,
    /// Decides whether a failed attempt is worth repeating.
    pub retryable: fn(&ProviderError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(16),
            jitter: true,
            retryable: ProviderError::is_retryable,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
            retryable: ProviderError::is_retryable,
        }
    }

    /// Replace the retry predicate.
    pub fn retry_if(mut self, predicate: fn(&ProviderError) -> bool) -> Self {
        self.retryable = predicate;
        self
    }

    /// Upper bound of the backoff before the given attempt (0 for the first).
    pub fn backoff_cap(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2).min(20);
        let scaled = self.base_delay.saturating_mul(1u32 << exp);
        scaled.min(self.max_delay)
    }

    /// Actual sleep before the given attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let cap = self.backoff_cap(attempt);
        if !self.jitter || cap.is_zero() {
            return cap;
        }
        let millis = cap.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(0..=millis))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// attempts run out. Each attempt is limited to `attempt_timeout`.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        attempt_timeout: Duration,
        mut op: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let delay = self.delay_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let err = match with_deadline(attempt_timeout, op()).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !(self.retryable)(&err) || attempt >= attempts {
                return Err(err);
            }
            warn!(
                call = label,
                attempt,
                max_attempts = attempts,
                error = %err,
                "transient provider error, retrying"
            );
            attempt += 1;
        }
    }
}

/// Bound a provider call by `timeout`, mapping an overrun to
/// [`ProviderError::Timeout`].
pub async fn with_deadline<T, Fut>(timeout: Duration, fut: Fut) -> Result<T, ProviderError>
where
    Fut: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(timeout.as_secs())),
    }
}
