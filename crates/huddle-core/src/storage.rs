//! Keyed durable store abstraction.
//!
//! Every durable table the control plane touches (idempotency records,
//! rate-limit windows, note documents and operation logs, batched event
//! rows, result blobs) is reached through [`StorageBackend`]. The contract is
//! deliberately small: point reads, conditional writes, deletes and metadata
//! lookups by exact key. There are no scans.
//!
//! Version tokens are opaque strings. Conditional writes never fail with an
//! error when the precondition does not hold; they return
//! [`WriteResult::PreconditionFailed`] so callers can run their own
//! compare-and-swap loops.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result, poison_err};

/// Precondition for conditional writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if the key does not exist yet (insert).
    DoesNotExist,
    /// Write only if the stored version matches the given token (patch).
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns the new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns the current version token.
    PreconditionFailed {
        /// The version that caused the precondition to fail (`"0"` when absent).
        current_version: String,
    },
}

impl WriteResult {
    /// Returns `true` when the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object key.
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Version token for compare-and-swap writes.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Keyed durable store.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes with an optional precondition.
    ///
    /// Never returns an error for a precondition failure; that is a normal result.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object. Succeeds even if it doesn't exist.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if the object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

/// Reads and decodes a JSON object together with its version token.
///
/// Returns `None` if the object does not exist.
///
/// # Errors
///
/// Returns an error if the read fails or the payload does not decode.
pub async fn read_json<T, S>(storage: &S, path: &str) -> Result<Option<(T, String)>>
where
    T: DeserializeOwned,
    S: StorageBackend + ?Sized,
{
    let Some(meta) = storage.head(path).await? else {
        return Ok(None);
    };
    let bytes = match storage.get(path).await {
        Ok(bytes) => bytes,
        // Deleted between head and get.
        Err(Error::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    let value = serde_json::from_slice(&bytes)
        .map_err(|e| Error::serialization(format!("failed to decode '{path}': {e}")))?;
    Ok(Some((value, meta.version)))
}

/// Encodes a value as JSON and writes it with the given precondition.
///
/// # Errors
///
/// Returns an error if encoding or the write itself fails.
pub async fn write_json<T, S>(
    storage: &S,
    path: &str,
    value: &T,
    precondition: WritePrecondition,
) -> Result<WriteResult>
where
    T: Serialize + ?Sized,
    S: StorageBackend + ?Sized,
{
    let bytes = serde_json::to_vec(value)?;
    storage.put(path, Bytes::from(bytes), precondition).await
}

/// In-memory storage backend.
///
/// Thread-safe via `RwLock`. Versions are monotonically increasing integers
/// per key, rendered as strings.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: u64,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
            last_modified: Some(self.last_modified),
        }
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.objects.read().map_err(poison_err)?.len())
    }

    /// Returns `true` if nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Checks a precondition against the currently stored version.
///
/// Returns the conflicting version when the write must not proceed.
pub fn check_precondition(
    precondition: &WritePrecondition,
    current: Option<u64>,
) -> Option<String> {
    match (precondition, current) {
        (WritePrecondition::None, _) | (WritePrecondition::DoesNotExist, None) => None,
        (WritePrecondition::DoesNotExist, Some(v)) => Some(v.to_string()),
        (WritePrecondition::MatchesVersion(_), None) => Some("0".to_string()),
        (WritePrecondition::MatchesVersion(expected), Some(v)) => {
            (expected.parse::<u64>().ok() != Some(v)).then(|| v.to_string())
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.objects
            .read()
            .map_err(poison_err)?
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
        let mut objects = self.objects.write().map_err(poison_err)?;
        let current = objects.get(path).map(|o| o.version);

        if let Some(current_version) = check_precondition(&precondition, current) {
            return Ok(WriteResult::PreconditionFailed { current_version });
        }

        let version = current.map_or(1, |v| v + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.write().map_err(poison_err)?.remove(path);
        Ok(())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        Ok(self
            .objects
            .read()
            .map_err(poison_err)?
            .get(path)
            .map(|o| o.meta(path)))
    }
}
