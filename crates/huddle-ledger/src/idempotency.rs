//! Durable idempotency records for retry-safe write handlers.
//!
//! ## Protocol
//!
//! 1. The handler receives an idempotency key and a scope (the operation family).
//! 2. The ledger claims `(key, scope)` by writing a record with a
//!    `DoesNotExist` precondition, before any side effect runs.
//!    - Claimed: run the operation, then patch the record with the result.
//!    - Exists with a result: decode and return it without re-running.
//!    - Exists without a result: the first attempt is still running. The
//!      record is taken over only once it is older than the stale timeout.
//! 3. Small primitive results are stored inline on the record; anything else
//!    goes to the blob store and the record keeps a reference and byte size.
//!
//! ## Storage Layout
//!
//! ```text
//! idempotency/{scope}/{key_hash_prefix}/{key_hash}.json
//! idempotency-results/{scope}/{key_hash}.json
//! ```
//!
//! Where `key_hash` is `SHA256(key)` in hex and `key_hash_prefix` its first
//! two characters.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use huddle_core::clock::{Clock, system_clock};
use huddle_core::error::{Error, ErrorCode, Result};
use huddle_core::storage::{
    StorageBackend, WritePrecondition, WriteResult, read_json, write_json,
};

use crate::metrics::{record_blob_write, record_idempotency_check, record_idempotency_takeover};

/// Prefix for idempotency records.
pub const IDEMPOTENCY_PREFIX: &str = "idempotency";

/// Prefix for out-of-line results.
pub const RESULT_PREFIX: &str = "idempotency-results";

/// Largest encoded primitive result kept inline on the record.
pub const DEFAULT_INLINE_LIMIT_BYTES: usize = 1024;

/// Default timeout for stale in-progress records (5 minutes).
pub const DEFAULT_STALE_TIMEOUT: chrono::Duration = chrono::Duration::minutes(5);

const MAX_KEY_LEN: usize = 255;

/// Computes the SHA256 hash of an idempotency key.
#[must_use]
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Returns the storage path of the record for `key_hash` in `scope`.
#[must_use]
pub fn record_path(scope: &str, key_hash: &str) -> String {
    let prefix = &key_hash[..2.min(key_hash.len())];
    format!("{IDEMPOTENCY_PREFIX}/{scope}/{prefix}/{key_hash}.json")
}

/// Returns the blob path of an out-of-line result.
#[must_use]
pub fn result_path(scope: &str, key_hash: &str) -> String {
    format!("{RESULT_PREFIX}/{scope}/{key_hash}.json")
}

fn validate_key_and_scope(key: &str, scope: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::validation("idempotency key cannot be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::validation(format!(
            "idempotency key is too long (maximum {MAX_KEY_LEN} bytes)"
        )));
    }
    if scope.is_empty()
        || !scope
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::validation(format!(
            "idempotency scope '{scope}' must be a non-empty path segment"
        )));
    }
    Ok(())
}

/// Failures raised before the operation could reach anything external.
const fn rules_out_side_effect(err: &Error) -> bool {
    matches!(
        err.code(),
        ErrorCode::Validation
            | ErrorCode::Unauthorized
            | ErrorCode::Forbidden
            | ErrorCode::PreconditionFailed
    )
}

/// Where a completed result lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resultType", rename_all = "snake_case")]
pub enum ResultMetadata {
    /// Primitive result stored on the record itself.
    Inline {
        /// The result value.
        #[serde(rename = "resultInline")]
        result_inline: Value,
    },
    /// JSON result stored in the blob store.
    Storage {
        /// Blob path.
        #[serde(rename = "resultRef")]
        result_ref: String,
        /// Encoded result size in bytes.
        #[serde(rename = "resultSize")]
        result_size: u64,
    },
}

impl ResultMetadata {
    /// Returns the storage kind.
    #[must_use]
    pub const fn kind(&self) -> ResultKind {
        match self {
            Self::Inline { .. } => ResultKind::Inline,
            Self::Storage { .. } => ResultKind::Storage,
        }
    }
}

/// Storage kind of a completed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// Stored on the record.
    Inline,
    /// Stored in the blob store.
    Storage,
}

impl ResultKind {
    /// Returns the kind as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Storage => "storage",
        }
    }
}

/// Durable record reserving `(key, scope)`.
///
/// Path: `idempotency/{scope}/{key_hash_prefix}/{key_hash}.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    /// The raw idempotency key.
    pub key: String,
    /// Operation family the key belongs to.
    pub scope: String,
    /// When the record was claimed.
    pub created_at: DateTime<Utc>,
    /// Hash of the request the key was first used with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Result location; `None` while the operation is in progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResultMetadata>,
}

impl IdempotencyRecord {
    fn in_progress(key: &str, scope: &str, fingerprint: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            scope: scope.to_string(),
            created_at: now,
            fingerprint: fingerprint.map(str::to_string),
            metadata: None,
        }
    }

    /// Returns the hash of the key.
    #[must_use]
    pub fn key_hash(&self) -> String {
        hash_key(&self.key)
    }

    /// Returns the storage path of this record.
    #[must_use]
    pub fn path(&self) -> String {
        record_path(&self.scope, &self.key_hash())
    }

    /// Returns `true` once a result has been recorded.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.metadata.is_some()
    }

    /// Returns whether an in-progress record can be taken over.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        !self.is_complete() && self.created_at + timeout < now
    }
}

/// A stored result as returned by [`IdempotencyLedger::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedResult {
    /// Where the result was stored.
    pub kind: ResultKind,
    /// The decoded result; `Null` when a referenced blob is missing.
    pub value: Value,
    /// Encoded size in bytes.
    pub size: u64,
}

/// Ledger tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Largest encoded primitive kept inline.
    #[serde(default = "default_inline_limit_bytes")]
    pub inline_limit_bytes: usize,
    /// Age after which an unfinished record may be taken over.
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
}

const fn default_inline_limit_bytes() -> usize {
    DEFAULT_INLINE_LIMIT_BYTES
}

const fn default_stale_timeout_secs() -> u64 {
    300
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            inline_limit_bytes: default_inline_limit_bytes(),
            stale_timeout_secs: default_stale_timeout_secs(),
        }
    }
}

enum Claim {
    Claimed {
        record: IdempotencyRecord,
        version: String,
    },
    Existing {
        record: Box<IdempotencyRecord>,
        version: String,
    },
}

/// Key/scope-addressed record store backing idempotent handlers.
#[derive(Clone)]
pub struct IdempotencyLedger {
    records: Arc<dyn StorageBackend>,
    blobs: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    inline_limit_bytes: usize,
    stale_timeout: chrono::Duration,
}

impl fmt::Debug for IdempotencyLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyLedger")
            .field("inline_limit_bytes", &self.inline_limit_bytes)
            .field("stale_timeout", &self.stale_timeout)
            .finish_non_exhaustive()
    }
}

impl IdempotencyLedger {
    /// Creates a ledger that keeps records and result blobs in `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            records: Arc::clone(&storage),
            blobs: storage,
            clock: system_clock(),
            inline_limit_bytes: DEFAULT_INLINE_LIMIT_BYTES,
            stale_timeout: DEFAULT_STALE_TIMEOUT,
        }
    }

    /// Stores out-of-line results in a separate blob store.
    #[must_use]
    pub fn with_blob_store(mut self, blobs: Arc<dyn StorageBackend>) -> Self {
        self.blobs = blobs;
        self
    }

    /// Uses `clock` for record timestamps and staleness.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Applies `config`.
    #[must_use]
    pub fn with_config(mut self, config: &IdempotencyConfig) -> Self {
        self.inline_limit_bytes = config.inline_limit_bytes;
        self.stale_timeout =
            chrono::Duration::seconds(i64::try_from(config.stale_timeout_secs).unwrap_or(i64::MAX));
        self
    }

    /// Claims `(key, scope)`.
    ///
    /// Returns `None` when this call created the record, otherwise the
    /// existing record.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed key or scope, or a storage
    /// error if the record store is unavailable.
    pub async fn begin(&self, key: &str, scope: &str) -> Result<Option<IdempotencyRecord>> {
        match self.claim(key, scope, None).await? {
            Claim::Claimed { .. } => Ok(None),
            Claim::Existing { record, .. } => Ok(Some(*record)),
        }
    }

    /// Records the result of the operation that claimed `(key, scope)`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key was never claimed, `PRECONDITION_FAILED`
    /// if the record changed concurrently, or a storage error.
    pub async fn complete(&self, key: &str, scope: &str, result: &Value) -> Result<ResultMetadata> {
        validate_key_and_scope(key, scope)?;
        let path = record_path(scope, &hash_key(key));
        let Some((record, version)) =
            read_json::<IdempotencyRecord, _>(self.records.as_ref(), &path).await?
        else {
            return Err(Error::NotFound(format!(
                "idempotency record for key '{key}' in scope '{scope}'"
            )));
        };
        self.complete_record(record, version, result).await
    }

    /// Returns the stored result for `(key, scope)`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown key, `PRECONDITION_FAILED` while the
    /// operation is still in progress, and `STORAGE_READ_FAILED` when a
    /// referenced blob exists but cannot be read.
    pub async fn resolve(&self, key: &str, scope: &str) -> Result<ResolvedResult> {
        validate_key_and_scope(key, scope)?;
        let path = record_path(scope, &hash_key(key));
        let Some((record, _)) =
            read_json::<IdempotencyRecord, _>(self.records.as_ref(), &path).await?
        else {
            return Err(Error::NotFound(format!(
                "idempotency record for key '{key}' in scope '{scope}'"
            )));
        };
        self.resolve_record(&record).await
    }

    /// Runs `op` at most once per `(key, scope)`.
    ///
    /// A repeated call returns the stored result without invoking `op`. When
    /// `fingerprint` is given it must match the one recorded on first use.
    ///
    /// If `op` fails with an input, authorization or precondition error the
    /// key is released, since no side effect can have happened. Any other
    /// failure may have taken effect remotely, so the record stays in
    /// progress and the key is only reusable once the record goes stale.
    ///
    /// # Errors
    ///
    /// Returns `PRECONDITION_FAILED` when the key was used with a different
    /// fingerprint or the first attempt is still running, the error of `op`,
    /// or any ledger storage error.
    #[tracing::instrument(skip(self, fingerprint, op))]
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        scope: &str,
        fingerprint: Option<&str>,
        op: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (record, version) = match self.claim(key, scope, fingerprint).await? {
            Claim::Claimed { record, version } => {
                record_idempotency_check(scope, "proceed");
                (record, version)
            }
            Claim::Existing { record, version } => {
                if let (Some(stored), Some(given)) = (record.fingerprint.as_deref(), fingerprint) {
                    if stored != given {
                        record_idempotency_check(scope, "conflict");
                        return Err(Error::precondition(format!(
                            "idempotency key '{key}' in scope '{scope}' was used with a different request"
                        )));
                    }
                }

                if record.is_complete() {
                    record_idempotency_check(scope, "replay");
                    let resolved = self.resolve_record(&record).await?;
                    tracing::debug!(kind = resolved.kind.as_str(), "replaying stored result");
                    return serde_json::from_value(resolved.value).map_err(|e| {
                        Error::serialization(format!(
                            "stored result for key '{key}' in scope '{scope}' does not decode: {e}"
                        ))
                    });
                }

                if !record.is_stale(self.clock.now(), self.stale_timeout) {
                    record_idempotency_check(scope, "in_progress");
                    return Err(Error::precondition(format!(
                        "request with idempotency key '{key}' in scope '{scope}' is still in progress"
                    )));
                }

                self.take_over(*record, version, fingerprint).await?
            }
        };

        match op().await {
            Ok(value) => {
                let encoded = serde_json::to_value(&value)?;
                self.complete_record(record, version, &encoded).await?;
                Ok(value)
            }
            Err(err) if rules_out_side_effect(&err) => {
                if let Err(release) = self.records.delete(&record.path()).await {
                    tracing::warn!(error = %release, "failed to release idempotency key");
                }
                Err(err)
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "operation outcome unknown, idempotency key held until stale"
                );
                Err(err)
            }
        }
    }

    /// Deletes the record for `(key, scope)` and its result blob.
    ///
    /// Returns `false` if there was no record.
    ///
    /// # Errors
    ///
    /// Returns a storage error if either delete fails.
    pub async fn remove(&self, key: &str, scope: &str) -> Result<bool> {
        validate_key_and_scope(key, scope)?;
        let path = record_path(scope, &hash_key(key));
        let Some((record, _)) =
            read_json::<IdempotencyRecord, _>(self.records.as_ref(), &path).await?
        else {
            return Ok(false);
        };
        if let Some(ResultMetadata::Storage { result_ref, .. }) = &record.metadata {
            self.blobs.delete(result_ref).await?;
        }
        self.records.delete(&path).await?;
        Ok(true)
    }

    async fn claim(&self, key: &str, scope: &str, fingerprint: Option<&str>) -> Result<Claim> {
        validate_key_and_scope(key, scope)?;
        let record = IdempotencyRecord::in_progress(key, scope, fingerprint, self.clock.now());
        let path = record.path();

        match write_json(
            self.records.as_ref(),
            &path,
            &record,
            WritePrecondition::DoesNotExist,
        )
        .await?
        {
            WriteResult::Success { version } => Ok(Claim::Claimed { record, version }),
            WriteResult::PreconditionFailed { .. } => {
                match read_json::<IdempotencyRecord, _>(self.records.as_ref(), &path).await? {
                    Some((existing, version)) => Ok(Claim::Existing {
                        record: Box::new(existing),
                        version,
                    }),
                    None => Err(Error::internal(format!(
                        "idempotency record for key '{key}' in scope '{scope}' disappeared during claim"
                    ))),
                }
            }
        }
    }

    async fn take_over(
        &self,
        stale: IdempotencyRecord,
        version: String,
        fingerprint: Option<&str>,
    ) -> Result<(IdempotencyRecord, String)> {
        let fingerprint = fingerprint.map(str::to_string).or(stale.fingerprint);
        let refreshed = IdempotencyRecord {
            key: stale.key,
            scope: stale.scope,
            created_at: self.clock.now(),
            fingerprint,
            metadata: None,
        };
        tracing::warn!(
            key = %refreshed.key,
            scope = %refreshed.scope,
            started_at = %stale.created_at,
            "taking over stale in-progress idempotency record"
        );

        match write_json(
            self.records.as_ref(),
            &refreshed.path(),
            &refreshed,
            WritePrecondition::MatchesVersion(version),
        )
        .await?
        {
            WriteResult::Success { version } => {
                record_idempotency_takeover(&refreshed.scope, "success");
                record_idempotency_check(&refreshed.scope, "proceed");
                Ok((refreshed, version))
            }
            WriteResult::PreconditionFailed { .. } => {
                record_idempotency_takeover(&refreshed.scope, "race_detected");
                record_idempotency_check(&refreshed.scope, "in_progress");
                Err(Error::precondition(format!(
                    "request with idempotency key '{}' in scope '{}' is still in progress",
                    refreshed.key, refreshed.scope
                )))
            }
        }
    }

    async fn complete_record(
        &self,
        mut record: IdempotencyRecord,
        version: String,
        result: &Value,
    ) -> Result<ResultMetadata> {
        let metadata = self.store_result(&record, result).await?;
        record.metadata = Some(metadata.clone());

        match write_json(
            self.records.as_ref(),
            &record.path(),
            &record,
            WritePrecondition::MatchesVersion(version),
        )
        .await?
        {
            WriteResult::Success { .. } => Ok(metadata),
            WriteResult::PreconditionFailed { current_version } => Err(Error::precondition(
                format!(
                    "idempotency record for key '{}' in scope '{}' changed concurrently (now version {current_version})",
                    record.key, record.scope
                ),
            )),
        }
    }

    async fn store_result(&self, record: &IdempotencyRecord, result: &Value) -> Result<ResultMetadata> {
        let encoded = serde_json::to_vec(result)?;
        let primitive = matches!(
            result,
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
        );
        if primitive && encoded.len() <= self.inline_limit_bytes {
            return Ok(ResultMetadata::Inline {
                result_inline: result.clone(),
            });
        }

        let result_ref = result_path(&record.scope, &record.key_hash());
        let result_size = encoded.len() as u64;
        self.blobs
            .put(&result_ref, Bytes::from(encoded), WritePrecondition::None)
            .await?;
        record_blob_write(&record.scope);
        Ok(ResultMetadata::Storage {
            result_ref,
            result_size,
        })
    }

    async fn resolve_record(&self, record: &IdempotencyRecord) -> Result<ResolvedResult> {
        match &record.metadata {
            None => Err(Error::precondition(format!(
                "idempotency key '{}' in scope '{}' has no result yet",
                record.key, record.scope
            ))),
            Some(ResultMetadata::Inline { result_inline }) => Ok(ResolvedResult {
                kind: ResultKind::Inline,
                size: serde_json::to_vec(result_inline)?.len() as u64,
                value: result_inline.clone(),
            }),
            Some(ResultMetadata::Storage {
                result_ref,
                result_size,
            }) => {
                let read_failed = |message: String| Error::StorageReadFailed {
                    key: record.key.clone(),
                    scope: record.scope.clone(),
                    reference: result_ref.clone(),
                    message,
                };
                match self.blobs.get(result_ref).await {
                    Ok(bytes) => {
                        let value = serde_json::from_slice(&bytes)
                            .map_err(|e| read_failed(format!("stored result does not decode: {e}")))?;
                        Ok(ResolvedResult {
                            kind: ResultKind::Storage,
                            value,
                            size: bytes.len() as u64,
                        })
                    }
                    Err(Error::NotFound(_)) => {
                        tracing::warn!(
                            key = %record.key,
                            scope = %record.scope,
                            reference = %result_ref,
                            expected_size = result_size,
                            "stored result is missing; resolving as empty"
                        );
                        Ok(ResolvedResult {
                            kind: ResultKind::Storage,
                            value: Value::Null,
                            size: 0,
                        })
                    }
                    Err(e) => Err(read_failed(e.to_string())),
                }
            }
        }
    }
}
