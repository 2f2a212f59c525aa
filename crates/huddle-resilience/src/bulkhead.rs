//! Bounded concurrency per resource.
//!
//! A bulkhead caps in-flight operations against one resource. Callers past
//! the cap wait in FIFO order (tokio's semaphore is fair) and are admitted
//! as slots free up.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use huddle_core::{Error, Result};

use crate::metrics::set_bulkhead_occupancy;

fn default_max_concurrent() -> usize {
    10
}

/// Bulkhead configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkheadConfig {
    /// Maximum operations in flight at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Occupancy of a bulkhead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BulkheadStats {
    /// Operations currently holding a slot.
    pub active: usize,
    /// Callers waiting for a slot.
    pub queued: usize,
    /// Slot count.
    pub max: usize,
}

/// Concurrency limiter for one resource.
#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    active: AtomicUsize,
    queued: AtomicUsize,
}

/// Increments a counter for as long as it lives.
struct Occupancy<'a> {
    bulkhead: &'a Bulkhead,
    counter: &'a AtomicUsize,
}

impl<'a> Occupancy<'a> {
    fn enter(bulkhead: &'a Bulkhead, counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        bulkhead.publish();
        Self { bulkhead, counter }
    }
}

impl Drop for Occupancy<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        self.bulkhead.publish();
    }
}

impl Bulkhead {
    /// Creates a bulkhead with `max_concurrent` slots (at least one).
    #[must_use]
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            name: name.into(),
            max_concurrent,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        }
    }

    /// Creates a bulkhead from configuration.
    #[must_use]
    pub fn from_config(name: impl Into<String>, config: &BulkheadConfig) -> Self {
        Self::new(name, config.max_concurrent)
    }

    /// Returns the resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self) {
        let stats = self.stats();
        set_bulkhead_occupancy(&self.name, stats.active, stats.queued);
    }

    /// Runs `op` once a slot is free.
    ///
    /// # Errors
    ///
    /// Returns the operation's error, or [`Error::Internal`] if the bulkhead
    /// was closed while waiting.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = {
            let _waiting = Occupancy::enter(self, &self.queued);
            self.semaphore
                .acquire()
                .await
                .map_err(|_| Error::internal(format!("bulkhead '{}' is closed", self.name)))?
        };
        let result = {
            let _running = Occupancy::enter(self, &self.active);
            op().await
        };
        drop(permit);
        result
    }

    /// Returns current occupancy.
    #[must_use]
    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            active: self.active.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            max: self.max_concurrent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn bounds_concurrency_and_reports_queue() -> Result<()> {
        let bulkhead = Arc::new(Bulkhead::new("embeddings", 2));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..5 {
            let bulkhead = Arc::clone(&bulkhead);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                bulkhead
                    .execute(|| async {
                        let active = bulkhead.stats().active;
                        peak.fetch_max(active, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(())
                    })
                    .await
            }));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        let stats = bulkhead.stats();
        assert_eq!(stats, BulkheadStats { active: 2, queued: 3, max: 2 });

        for handle in handles {
            handle.await.expect("join")?;
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(bulkhead.stats(), BulkheadStats { active: 0, queued: 0, max: 2 });
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_served_in_arrival_order() -> Result<()> {
        let bulkhead = Arc::new(Bulkhead::new("video", 1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        for i in 0..4 {
            let bulkhead = Arc::clone(&bulkhead);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                bulkhead
                    .execute(|| async {
                        order.lock().expect("lock").push(i);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(())
                    })
                    .await
            }));
            // Stagger arrivals so the queue order is well defined.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for handle in handles {
            handle.await.expect("join")?;
        }
        assert_eq!(*order.lock().expect("lock"), vec![0, 1, 2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn error_releases_slot() {
        let bulkhead = Bulkhead::new("video", 1);
        let result: Result<()> = bulkhead
            .execute(|| async { Err(Error::external("video", "down")) })
            .await;
        assert!(result.is_err());
        assert_eq!(bulkhead.stats().active, 0);

        let ok = bulkhead.execute(|| async { Ok(1) }).await;
        assert_eq!(ok.ok(), Some(1));
    }
}
