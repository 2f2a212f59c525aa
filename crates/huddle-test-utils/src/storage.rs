//! Test storage with operation tracing and failure injection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use huddle_core::error::{Error, Result};
use huddle_core::storage::{
    ObjectMeta, StorageBackend, WritePrecondition, WriteResult, check_precondition,
};

/// Record of a storage operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// Get operation.
    Get {
        /// Path that was read.
        path: String,
    },
    /// Head operation.
    Head {
        /// Path that was checked.
        path: String,
    },
    /// Put operation.
    Put {
        /// Path that was written.
        path: String,
        /// Precondition used.
        precondition: WritePrecondition,
        /// Whether the write was applied.
        applied: bool,
    },
    /// Delete operation.
    Delete {
        /// Path that was deleted.
        path: String,
    },
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: u64,
    last_modified: DateTime<Utc>,
}

/// In-memory storage backend that records operations and fails on demand.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBackend {
    data: Arc<Mutex<HashMap<String, StoredObject>>>,
    operations: Arc<Mutex<Vec<StorageOp>>>,
    fail_paths: Arc<Mutex<Vec<String>>>,
    fail_read_paths: Arc<Mutex<Vec<String>>>,
    latency: Option<Duration>,
}

impl TracingMemoryBackend {
    /// Creates a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend that sleeps before every operation.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Returns all recorded operations.
    pub fn operations(&self) -> Vec<StorageOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Returns recorded puts whose path starts with `prefix`.
    pub fn puts_under(&self, prefix: &str) -> Vec<StorageOp> {
        self.operations()
            .into_iter()
            .filter(|op| matches!(op, StorageOp::Put { path, .. } if path.starts_with(prefix)))
            .collect()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Makes every operation on paths under `prefix` fail.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.fail_paths.lock().expect("lock").push(prefix.into());
    }

    /// Makes reads (`get`) of paths under `prefix` fail; other operations succeed.
    pub fn inject_read_failure(&self, prefix: impl Into<String>) {
        self.fail_read_paths.lock().expect("lock").push(prefix.into());
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.fail_paths.lock().expect("lock").clear();
        self.fail_read_paths.lock().expect("lock").clear();
    }

    /// Returns the stored bytes at `path`, bypassing tracing and failures.
    pub fn raw(&self, path: &str) -> Option<Bytes> {
        self.data.lock().expect("lock").get(path).map(|o| o.data.clone())
    }

    /// Decodes the JSON stored at `path`, bypassing tracing and failures.
    pub fn raw_json(&self, path: &str) -> Option<serde_json::Value> {
        self.raw(path)
            .map(|bytes| serde_json::from_slice(&bytes).expect("stored JSON"))
    }

    /// Removes `path` directly, bypassing tracing and failures.
    pub fn remove_raw(&self, path: &str) {
        self.data.lock().expect("lock").remove(path);
    }

    /// Returns all stored paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.data.lock().expect("lock").keys().cloned().collect();
        paths.sort();
        paths
    }

    fn record(&self, op: StorageOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(list: &Mutex<Vec<String>>, path: &str) -> Result<()> {
        if list.lock().expect("lock").iter().any(|p| path.starts_with(p)) {
            return Err(Error::storage(format!("injected failure for path: {path}")));
        }
        Ok(())
    }

    async fn maybe_delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.maybe_delay().await;
        Self::check_failure(&self.fail_paths, path)?;
        Self::check_failure(&self.fail_read_paths, path)?;
        self.record(StorageOp::Get {
            path: path.to_string(),
        });

        self.data
            .lock()
            .expect("lock")
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.maybe_delay().await;
        Self::check_failure(&self.fail_paths, path)?;

        let mut store = self.data.lock().expect("lock");
        let current = store.get(path).map(|o| o.version);
        let result = if let Some(current_version) = check_precondition(&precondition, current) {
            WriteResult::PreconditionFailed { current_version }
        } else {
            let version = current.map_or(1, |v| v + 1);
            store.insert(
                path.to_string(),
                StoredObject {
                    data,
                    version,
                    last_modified: Utc::now(),
                },
            );
            WriteResult::Success {
                version: version.to_string(),
            }
        };
        drop(store);

        self.record(StorageOp::Put {
            path: path.to_string(),
            precondition,
            applied: result.is_success(),
        });
        Ok(result)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.maybe_delay().await;
        Self::check_failure(&self.fail_paths, path)?;
        self.record(StorageOp::Delete {
            path: path.to_string(),
        });
        self.data.lock().expect("lock").remove(path);
        Ok(())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.maybe_delay().await;
        Self::check_failure(&self.fail_paths, path)?;
        self.record(StorageOp::Head {
            path: path.to_string(),
        });

        Ok(self.data.lock().expect("lock").get(path).map(|o| ObjectMeta {
            path: path.to_string(),
            size: o.data.len() as u64,
            version: o.version.to_string(),
            last_modified: Some(o.last_modified),
        }))
    }
}
