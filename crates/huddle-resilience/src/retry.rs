//! Retry with exponential backoff and jitter.
//!
//! The delay before retry `n` (1-based, counting failed attempts) is
//! `min(base * multiplier^(n-1), max)` plus a random jitter of up to 10% of
//! that value. The error from the last attempt is returned as-is.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use huddle_core::{Error, Result};

use crate::metrics::record_retry;

/// Jitter bound as a fraction of the capped delay.
pub const JITTER_FRACTION: f64 = 0.10;

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on the backoff before jitter, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Returns the backoff before jitter for retry `attempt` (1-based).
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Returns the jittered delay for retry `attempt` using `rng`.
    #[must_use]
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let capped = self.capped_delay(attempt);
        let bound = capped.mul_f64(JITTER_FRACTION);
        let jitter = if bound.is_zero() {
            Duration::ZERO
        } else {
            bound.mul_f64(rng.gen_range(0.0..=1.0))
        };
        capped + jitter
    }

    /// Returns the jittered delay for retry `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Runs `op`, retrying errors the default predicate considers transient.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error when attempts are exhausted, or the
    /// first non-retryable error.
    pub async fn run<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_with(operation, Error::is_retryable, op).await
    }

    /// Runs `op`, retrying errors for which `should_retry` returns `true`.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error when attempts are exhausted, or the
    /// first error `should_retry` rejects.
    pub async fn run_with<T, F, Fut, P>(&self, operation: &str, should_retry: P, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= max_attempts || !should_retry(&err) => {
                    tracing::debug!(
                        operation,
                        attempt,
                        code = %err.code(),
                        "giving up"
                    );
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "operation failed, retrying"
                    );
                    record_retry(operation);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
