//! Fixed-window rate limiting backed by durable counters.
//!
//! Each `(action, subject, window)` triple owns one counter object at
//! `rate_limits/{action}/{subject}/{window_start}.json`. The window start is
//! `floor(now_ms / window_ms) * window_ms`, so every instance computes the
//! same key without coordination. Counters are created with a
//! `DoesNotExist` write and incremented with version-matched writes; a lost
//! race re-reads and tries again.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use huddle_core::clock::{Clock, system_clock};
use huddle_core::error::{Error, Result};
use huddle_core::storage::{
    StorageBackend, WritePrecondition, WriteResult, read_json, write_json,
};

use crate::metrics::{record_cas_retry, record_rate_limit};

/// Prefix for rate-limit window counters.
pub const RATE_LIMIT_PREFIX: &str = "rate_limits";

const MAX_CAS_ATTEMPTS: usize = 10;

/// Limit applied to one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Calls allowed per subject per window.
    pub max_count: u32,
}

impl RateLimitRule {
    /// Creates a rule.
    #[must_use]
    pub const fn new(window_ms: u64, max_count: u32) -> Self {
        Self {
            window_ms,
            max_count,
        }
    }

    /// Checks that the window and count are positive.
    ///
    /// # Errors
    ///
    /// Returns a validation error otherwise.
    pub fn validate(&self) -> Result<()> {
        if self.window_ms == 0 || i64::try_from(self.window_ms).is_err() {
            return Err(Error::validation(format!(
                "rate limit window must be between 1 and {} ms",
                i64::MAX
            )));
        }
        if self.max_count == 0 {
            return Err(Error::validation("rate limit max_count must be positive"));
        }
        Ok(())
    }
}

/// Stored counter for one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateWindow {
    /// Rate-limited subject.
    pub subject: String,
    /// Rate-limited action.
    pub action: String,
    /// Window start in epoch milliseconds.
    pub window_start: i64,
    /// Calls counted so far; never exceeds the rule's `max_count`.
    pub count: u32,
}

/// Outcome of an allowed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    /// Calls left in the current window.
    pub remaining: u32,
    /// When the current window ends.
    pub reset_at: DateTime<Utc>,
}

/// Returns the start of the fixed window containing `now_ms`.
#[must_use]
pub const fn window_start(now_ms: i64, window_ms: i64) -> i64 {
    now_ms.div_euclid(window_ms) * window_ms
}

/// Returns the counter path for a window.
#[must_use]
pub fn window_path(action: &str, subject: &str, window_start: i64) -> String {
    format!("{RATE_LIMIT_PREFIX}/{action}/{subject}/{window_start}.json")
}

fn validate_segment(kind: &str, value: &str) -> Result<()> {
    if value.is_empty()
        || !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(Error::validation(format!(
            "rate limit {kind} '{value}' must be a non-empty path segment"
        )));
    }
    Ok(())
}

/// Per-subject fixed-window limiter.
#[derive(Clone)]
pub struct RateLimiter {
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Creates a limiter that keeps counters in `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            clock: system_clock(),
        }
    }

    /// Uses `clock` to place calls in windows.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Counts one call by `subject` to `action` under `rule`.
    ///
    /// # Errors
    ///
    /// See [`RateLimiter::enforce`].
    pub async fn enforce_rule(
        &self,
        subject: &str,
        action: &str,
        rule: RateLimitRule,
    ) -> Result<RateLimitDecision> {
        self.enforce(subject, action, rule.window_ms, rule.max_count)
            .await
    }

    /// Counts one call by `subject` to `action`, allowing at most `max_count`
    /// calls per `window_ms` window.
    ///
    /// # Errors
    ///
    /// Returns `RATE_LIMIT_EXCEEDED` with the seconds until the window resets
    /// when the call would exceed `max_count`, a validation error for a bad
    /// rule or key, and a storage error if the counter stays contended.
    #[tracing::instrument(skip(self))]
    pub async fn enforce(
        &self,
        subject: &str,
        action: &str,
        window_ms: u64,
        max_count: u32,
    ) -> Result<RateLimitDecision> {
        RateLimitRule::new(window_ms, max_count).validate()?;
        validate_segment("subject", subject)?;
        validate_segment("action", action)?;

        let window_ms = i64::try_from(window_ms)
            .map_err(|_| Error::validation("rate limit window is too large"))?;
        let now_ms = self.clock.now_millis();
        let start = window_start(now_ms, window_ms);
        let reset_ms = start.saturating_add(window_ms);
        let reset_at = DateTime::from_timestamp_millis(reset_ms)
            .ok_or_else(|| Error::internal(format!("window end {reset_ms} is out of range")))?;
        let path = window_path(action, subject, start);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = read_json::<RateWindow, _>(self.storage.as_ref(), &path).await?;

            let (next, precondition) = match current {
                None => (
                    RateWindow {
                        subject: subject.to_string(),
                        action: action.to_string(),
                        window_start: start,
                        count: 1,
                    },
                    WritePrecondition::DoesNotExist,
                ),
                Some((window, _)) if window.count >= max_count => {
                    record_rate_limit(action, false);
                    let retry_after_secs = u64::try_from((reset_ms - now_ms + 999) / 1000)
                        .unwrap_or(1)
                        .max(1);
                    tracing::debug!(count = window.count, retry_after_secs, "rate limit exceeded");
                    return Err(Error::RateLimitExceeded {
                        subject: subject.to_string(),
                        action: action.to_string(),
                        retry_after_secs,
                        reset_at,
                    });
                }
                Some((window, version)) => (
                    RateWindow {
                        count: window.count + 1,
                        ..window
                    },
                    WritePrecondition::MatchesVersion(version),
                ),
            };

            match write_json(self.storage.as_ref(), &path, &next, precondition).await? {
                WriteResult::Success { .. } => {
                    record_rate_limit(action, true);
                    return Ok(RateLimitDecision {
                        remaining: max_count - next.count,
                        reset_at,
                    });
                }
                WriteResult::PreconditionFailed { .. } => record_cas_retry(action),
            }
        }

        Err(Error::storage(format!(
            "rate limit counter '{path}' stayed contended after {MAX_CAS_ATTEMPTS} attempts"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::ErrorCode;
    use huddle_core::clock::ManualClock;
    use huddle_test_utils::TracingMemoryBackend;
    use std::time::Duration;

    const MINUTE_MS: u64 = 60_000;

    fn limiter(start_ms: i64) -> (RateLimiter, TracingMemoryBackend, Arc<ManualClock>) {
        let storage = TracingMemoryBackend::new();
        let clock = Arc::new(ManualClock::at_millis(start_ms));
        let limiter = RateLimiter::new(Arc::new(storage.clone())).with_clock(clock.clone());
        (limiter, storage, clock)
    }

    #[test]
    fn windows_are_fixed_buckets() {
        assert_eq!(window_start(125_000, 60_000), 120_000);
        assert_eq!(window_start(120_000, 60_000), 120_000);
        assert_eq!(window_start(59_999, 60_000), 0);
    }

    #[tokio::test]
    async fn eleventh_call_in_window_is_rejected() -> Result<()> {
        let (limiter, _, clock) = limiter(1_700_000_040_000);

        for expected_remaining in (0..10).rev() {
            let decision = limiter.enforce("user_1", "send", MINUTE_MS, 10).await?;
            assert_eq!(decision.remaining, expected_remaining);
        }

        let err = limiter
            .enforce("user_1", "send", MINUTE_MS, 10)
            .await
            .expect_err("over the limit");
        assert_eq!(err.code(), ErrorCode::RateLimitExceeded);
        let Error::RateLimitExceeded {
            retry_after_secs,
            reset_at,
            ..
        } = err
        else {
            panic!("unexpected error variant");
        };
        assert_eq!(reset_at.timestamp_millis(), 1_700_000_100_000);
        assert_eq!(retry_after_secs, 60);

        clock.advance(Duration::from_secs(60));
        let decision = limiter.enforce("user_1", "send", MINUTE_MS, 10).await?;
        assert_eq!(decision.remaining, 9);
        Ok(())
    }

    #[tokio::test]
    async fn retry_after_counts_up_to_reset() -> Result<()> {
        // 10s into a one-minute window.
        let (limiter, _, _) = limiter(1_699_999_990_000);
        limiter.enforce("u", "a", MINUTE_MS, 1).await?;

        let Err(Error::RateLimitExceeded {
            retry_after_secs, ..
        }) = limiter.enforce("u", "a", MINUTE_MS, 1).await
        else {
            panic!("expected rate limit error");
        };
        assert_eq!(retry_after_secs, 50);
        Ok(())
    }

    #[tokio::test]
    async fn subjects_and_actions_have_separate_counters() -> Result<()> {
        let (limiter, storage, _) = limiter(0);
        limiter.enforce("u1", "send", MINUTE_MS, 1).await?;
        limiter.enforce("u2", "send", MINUTE_MS, 1).await?;
        limiter.enforce("u1", "react", MINUTE_MS, 1).await?;

        assert_eq!(
            storage.paths(),
            vec![
                "rate_limits/react/u1/0.json".to_string(),
                "rate_limits/send/u1/0.json".to_string(),
                "rate_limits/send/u2/0.json".to_string(),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn count_never_exceeds_max() -> Result<()> {
        let (limiter, storage, _) = limiter(0);
        let calls = (0..20).map(|_| limiter.enforce("u", "a", MINUTE_MS, 10));
        let results = futures::future::join_all(calls).await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 10);
        let stored = storage
            .raw_json("rate_limits/a/u/0.json")
            .expect("counter stored");
        assert_eq!(stored["count"], 10);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_bad_rules() {
        let (limiter, _, _) = limiter(0);
        assert!(limiter.enforce("u", "a", 0, 10).await.is_err());
        assert!(limiter.enforce("u", "a", MINUTE_MS, 0).await.is_err());
        assert!(limiter.enforce("u/x", "a", MINUTE_MS, 1).await.is_err());
    }
}
