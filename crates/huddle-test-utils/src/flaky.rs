//! Fake external dependency with scripted failures.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use huddle_core::{Error, Result};

/// Fails the first `failures` calls, then succeeds.
///
/// Clones share the call counter.
#[derive(Debug, Clone)]
pub struct FlakyDependency {
    name: String,
    failures: u32,
    calls: Arc<AtomicU32>,
    delay: Option<Duration>,
}

impl FlakyDependency {
    /// Creates a dependency that fails `failures` times with an external service error.
    pub fn new(name: impl Into<String>, failures: u32) -> Self {
        Self {
            name: name.into(),
            failures,
            calls: Arc::new(AtomicU32::new(0)),
            delay: None,
        }
    }

    /// Creates a dependency that never recovers.
    pub fn always_failing(name: impl Into<String>) -> Self {
        Self::new(name, u32::MAX)
    }

    /// Makes every call sleep for `delay` first.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns how many times the dependency was invoked.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Invokes the dependency, returning `value` once the scripted failures are used up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExternalService`] for the scripted failures.
    pub async fn call<T>(&self, value: T) -> Result<T> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if n <= self.failures {
            Err(Error::external(&self.name, format!("call {n} failed")))
        } else {
            Ok(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recovers_after_scripted_failures() {
        let dep = FlakyDependency::new("video", 2);
        assert!(dep.call(1).await.is_err());
        assert!(dep.clone().call(1).await.is_err());
        assert_eq!(dep.call(7).await.ok(), Some(7));
        assert_eq!(dep.calls(), 3);
    }
}
