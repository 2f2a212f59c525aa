//! Deadline wrapper for fallible operations.

use std::future::Future;
use std::time::Duration;

use huddle_core::{Error, Result};

use crate::metrics::record_timeout;

/// Races `future` against a timer of length `after`.
///
/// # Errors
///
/// Returns [`Error::Timeout`] when the timer wins, otherwise whatever the
/// operation returned.
pub async fn with_timeout<T, Fut>(operation: &str, after: Duration, future: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    if let Ok(result) = tokio::time::timeout(after, future).await {
        result
    } else {
        tracing::warn!(
            operation,
            timeout_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
            "operation timed out"
        );
        record_timeout(operation);
        Err(Error::Timeout {
            operation: operation.to_string(),
            after,
        })
    }
}

/// Like [`with_timeout`], but passes the future through when no deadline is set.
///
/// # Errors
///
/// See [`with_timeout`].
pub async fn with_optional_timeout<T, Fut>(
    operation: &str,
    after: Option<Duration>,
    future: Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match after {
        Some(after) => with_timeout(operation, after, future).await,
        None => future.await,
    }
}
