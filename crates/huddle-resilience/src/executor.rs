//! Guarded execution of external dependency calls.
//!
//! A [`GuardedExecutor`] composes the primitives in a fixed order:
//!
//! ```text
//! bulkhead ─▶ retry ─▶ circuit breaker ─▶ timeout ─▶ operation
//! ```
//!
//! One logical call holds one bulkhead slot across all of its attempts.
//! Every attempt passes through the breaker, so an opening breaker stops the
//! retry loop. When the final error is still transient the call is parked in
//! the dead-letter queue before the error is returned to the caller.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use huddle_core::{Result, dependency_span};
use tracing::Instrument;

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::CircuitBreaker;
use crate::dead_letter::DeadLetterQueue;
use crate::retry::RetryPolicy;
use crate::timeout::with_optional_timeout;

/// Executes calls against one dependency under its full resilience stack.
#[derive(Debug, Clone)]
pub struct GuardedExecutor {
    retry: RetryPolicy,
    timeout: Option<Duration>,
    breaker: Arc<CircuitBreaker>,
    bulkhead: Option<Arc<Bulkhead>>,
    dead_letters: Option<Arc<DeadLetterQueue>>,
}

impl GuardedExecutor {
    /// Creates an executor around `breaker` with no bulkhead, timeout or dead-letter sink.
    #[must_use]
    pub fn new(breaker: Arc<CircuitBreaker>, retry: RetryPolicy) -> Self {
        Self {
            retry,
            timeout: None,
            breaker,
            bulkhead: None,
            dead_letters: None,
        }
    }

    /// Sets a per-attempt deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Bounds concurrency with `bulkhead`.
    #[must_use]
    pub fn with_bulkhead(mut self, bulkhead: Arc<Bulkhead>) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    /// Parks exhausted calls in `dead_letters`.
    #[must_use]
    pub fn with_dead_letters(mut self, dead_letters: Arc<DeadLetterQueue>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    /// Returns the guarded dependency name.
    #[must_use]
    pub fn dependency(&self) -> &str {
        self.breaker.name()
    }

    /// Returns the breaker guarding this dependency.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Runs `op` under the resilience stack.
    ///
    /// `payload` describes the call for the dead-letter queue.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt, [`huddle_core::Error::CircuitOpen`]
    /// when the breaker rejects the call, or [`huddle_core::Error::Timeout`]
    /// when the final attempt ran out of time.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        payload: serde_json::Value,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let span = dependency_span(operation, self.breaker.name());
        let attempts = AtomicU32::new(0);

        let guarded = async {
            self.retry
                .run(operation, || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    let timeout = self.timeout;
                    // Not polled unless the breaker admits the attempt.
                    let attempt = op();
                    self.breaker
                        .call(move || with_optional_timeout(operation, timeout, attempt))
                })
                .await
        };

        let result = match &self.bulkhead {
            Some(bulkhead) => bulkhead.execute(|| guarded).instrument(span).await,
            None => guarded.instrument(span).await,
        };

        if let Err(err) = &result {
            if err.is_retryable() {
                if let Some(dead_letters) = &self.dead_letters {
                    dead_letters.add(
                        operation,
                        payload,
                        err,
                        attempts.load(Ordering::SeqCst),
                    )?;
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{BreakerConfig, CircuitState};
    use huddle_core::Error;
    use serde_json::json;

    fn executor(threshold: u32) -> (GuardedExecutor, Arc<DeadLetterQueue>) {
        let dlq = Arc::new(DeadLetterQueue::default());
        let breaker = Arc::new(CircuitBreaker::new(
            "video",
            BreakerConfig {
                failure_threshold: threshold,
                cooldown_ms: 30_000,
            },
        ));
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
            backoff_multiplier: 2.0,
        };
        let executor = GuardedExecutor::new(breaker, retry)
            .with_timeout(Duration::from_millis(500))
            .with_bulkhead(Arc::new(Bulkhead::new("video", 2)))
            .with_dead_letters(Arc::clone(&dlq));
        (executor, dlq)
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_recover() -> Result<()> {
        let (executor, dlq) = executor(5);
        let calls = AtomicU32::new(0);

        let room = executor
            .execute("create_room", json!({"meetingId": "mtg_1"}), || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::external("video", "502"))
                } else {
                    Ok("room_1".to_string())
                }
            })
            .await?;

        assert_eq!(room, "room_1");
        assert!(dlq.is_empty()?);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_calls_are_dead_lettered() -> Result<()> {
        let (executor, dlq) = executor(5);

        let result: Result<()> = executor
            .execute("create_room", json!({"meetingId": "mtg_2"}), || async {
                Err(Error::external("video", "503"))
            })
            .await;

        assert!(matches!(result, Err(Error::ExternalService { .. })));
        let parked = dlq.get_all()?;
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].attempts, 3);
        assert_eq!(parked[0].payload["meetingId"], "mtg_2");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out() -> Result<()> {
        let (executor, dlq) = executor(5);

        let result: Result<()> = executor
            .execute("create_room", json!(null), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(dlq.len()?, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_stops_retries() -> Result<()> {
        let (executor, dlq) = executor(2);
        let calls = AtomicU32::new(0);

        let result: Result<()> = executor
            .execute("create_room", json!(null), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::external("video", "503"))
            })
            .await;

        // Two failures open the breaker; the third attempt is rejected.
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(executor.breaker().snapshot()?.state, CircuitState::Open);
        assert!(dlq.is_empty()?, "circuit-open rejections are not dead-lettered");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn validation_errors_skip_retry_and_dead_letter() -> Result<()> {
        let (executor, dlq) = executor(5);
        let calls = AtomicU32::new(0);

        let result: Result<()> = executor
            .execute("create_room", json!(null), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::validation("room name too long"))
            })
            .await;

        assert!(matches!(result, Err(Error::Validation { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(dlq.is_empty()?);
        Ok(())
    }
}
