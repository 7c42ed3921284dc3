//! Bounded exponential backoff for provider calls.
//!
//! Each attempt runs under its own deadline. A retryable failure waits for
//! the computed backoff (or the server's `Retry-After`, whichever is longer,
//! but never more than `max_backoff_ms`) and tries again, up to
//! `max_retries` extra attempts. Terminal failures return immediately.

use crate::error::ProviderError;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_multiplier() -> f64 {
    2.0
}

/// Retry bounds and backoff curve.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryPolicy {
    /// Extra attempts after the first call. Default: 3.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry. Default: 500.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on any single delay. Default: 8000.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Growth factor between consecutive delays. Default: 2.0.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// A successful value together with the number of retries it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub retries: u32,
}

/// The last failure after the policy gave up.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure {
    pub error: ProviderError,
    /// Total calls made, including the first.
    pub attempts: u32,
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (zero-based), without server hints.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(32) as i32);
        let millis = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// Delay before retry number `retry`, honouring a server hint up to
    /// `max_backoff_ms`.
    pub fn delay_after(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let backoff = self.delay_for(retry);
        let cap = Duration::from_millis(self.max_backoff_ms).max(backoff);
        hint.map_or(backoff, |hint| backoff.max(hint).min(cap))
    }

    /// Runs `call` until it succeeds, fails terminally, or retries run out.
    ///
    /// `call` receives the zero-based attempt number. Every attempt is bounded
    /// by `deadline`; an elapsed deadline counts as [`ProviderError::Timeout`].
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        deadline: Duration,
        mut call: F,
    ) -> Result<Retried<T>, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0u32;
        loop {
            let error = match tokio::time::timeout(deadline, call(attempt)).await {
                Ok(Ok(value)) => {
                    if attempt > 0 {
                        debug!(operation, retries = attempt, "provider call succeeded after retry");
                    }
                    return Ok(Retried {
                        value,
                        retries: attempt,
                    });
                }
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Timeout,
            };

            if !error.is_retryable() || attempt >= self.max_retries {
                warn!(
                    operation,
                    attempts = attempt + 1,
                    error = %error,
                    "provider call failed"
                );
                return Err(RetryFailure {
                    error,
                    attempts: attempt + 1,
                });
            }

            let delay = self.delay_after(attempt, error.retry_after());
            warn!(
                operation,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying provider call"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
