//! Durable note documents and operation logs.
//!
//! ## Storage Layout
//!
//! ```text
//! notes/{meeting_id}/document.json
//! notes/{meeting_id}/sequence.json
//! notes/{meeting_id}/ops/{server_sequence:020}.json
//! ```
//!
//! The document is replaced with version-matched writes. Log entries are
//! insert-only, one per server sequence, so replaying a batch never
//! rewrites history.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use huddle_core::clock::{Clock, system_clock};
use huddle_core::error::{Error, Result};
use huddle_core::events::{NoteOperation, NoteOperationEnvelope};
use huddle_core::id::{MeetingId, UserId};
use huddle_core::storage::{
    StorageBackend, WritePrecondition, WriteResult, read_json, write_json,
};

use crate::document::NoteDocument;
use crate::merge::{MergeEngine, MergeOutcome};
use crate::metrics::{record_cas_retry, record_merge};

/// Prefix for note objects.
pub const NOTES_PREFIX: &str = "notes";

const MAX_CAS_ATTEMPTS: usize = 5;

pub(crate) fn note_prefix(meeting_id: &MeetingId) -> String {
    format!("{NOTES_PREFIX}/{meeting_id}")
}

/// Returns the document path for a meeting.
#[must_use]
pub fn document_path(meeting_id: &MeetingId) -> String {
    format!("{}/document.json", note_prefix(meeting_id))
}

/// Returns the log entry path for `(meeting_id, server_sequence)`.
#[must_use]
pub fn operation_path(meeting_id: &MeetingId, server_sequence: u64) -> String {
    format!("{}/ops/{server_sequence:020}.json", note_prefix(meeting_id))
}

/// What happened to a logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Applied; the document advanced one version.
    Applied,
    /// Skipped on a version mismatch.
    Conflict,
    /// Skipped as malformed or out of range.
    Rejected,
}

/// One operation log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationLogEntry {
    /// Meeting whose note was edited.
    pub meeting_id: MeetingId,
    /// Server sequence of the operation.
    pub server_sequence: u64,
    /// Client sequence of the operation.
    pub client_sequence: u64,
    /// Editing participant.
    pub actor: UserId,
    /// The edit.
    pub operation: NoteOperation,
    /// Outcome.
    pub status: OperationStatus,
    /// Document version after the operation (applied) or when it was skipped.
    pub document_version: u64,
    /// Rejection or conflict detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the entry was written.
    pub recorded_at: DateTime<Utc>,
}

impl OperationLogEntry {
    fn new(
        envelope: &NoteOperationEnvelope,
        status: OperationStatus,
        document_version: u64,
        reason: Option<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            meeting_id: envelope.meeting_id.clone(),
            server_sequence: envelope.server_sequence,
            client_sequence: envelope.client_sequence,
            actor: envelope.actor.clone(),
            operation: envelope.operation.clone(),
            status,
            document_version,
            reason,
            recorded_at,
        }
    }
}

/// A document with the version token it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    /// The document (empty at version 0 when none is stored).
    pub document: NoteDocument,
    /// Storage version token; `None` when nothing is stored yet.
    pub version: Option<String>,
}

/// Loads, merges and persists note documents.
#[derive(Clone)]
pub struct NoteStore {
    storage: Arc<dyn StorageBackend>,
    engine: MergeEngine,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for NoteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoteStore")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl NoteStore {
    /// Creates a store over `storage` with the default merge engine.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            engine: MergeEngine::default(),
            clock: system_clock(),
        }
    }

    /// Uses `engine` for merging.
    #[must_use]
    pub fn with_engine(mut self, engine: MergeEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Uses `clock` for log timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Loads the document for `meeting_id`.
    ///
    /// # Errors
    ///
    /// Returns a storage or serialization error.
    pub async fn load(&self, meeting_id: &MeetingId) -> Result<StoredDocument> {
        Ok(
            match read_json::<NoteDocument, _>(self.storage.as_ref(), &document_path(meeting_id))
                .await?
            {
                Some((document, version)) => StoredDocument {
                    document,
                    version: Some(version),
                },
                None => StoredDocument {
                    document: NoteDocument::default(),
                    version: None,
                },
            },
        )
    }

    /// Writes `document` if the stored version still matches `expected`.
    ///
    /// Returns the new version token, or `None` if another writer got there
    /// first.
    ///
    /// # Errors
    ///
    /// Returns a storage or serialization error.
    pub async fn save(
        &self,
        meeting_id: &MeetingId,
        document: &NoteDocument,
        expected: Option<&str>,
    ) -> Result<Option<String>> {
        let precondition = expected.map_or(WritePrecondition::DoesNotExist, |v| {
            WritePrecondition::MatchesVersion(v.to_string())
        });
        match write_json(
            self.storage.as_ref(),
            &document_path(meeting_id),
            document,
            precondition,
        )
        .await?
        {
            WriteResult::Success { version } => Ok(Some(version)),
            WriteResult::PreconditionFailed { .. } => Ok(None),
        }
    }

    /// Reads the log entry for `(meeting_id, server_sequence)`.
    ///
    /// # Errors
    ///
    /// Returns a storage or serialization error.
    pub async fn operation(
        &self,
        meeting_id: &MeetingId,
        server_sequence: u64,
    ) -> Result<Option<OperationLogEntry>> {
        Ok(read_json::<OperationLogEntry, _>(
            self.storage.as_ref(),
            &operation_path(meeting_id, server_sequence),
        )
        .await?
        .map(|(entry, _)| entry))
    }

    /// Merges `operations` into the meeting's document and persists the result.
    ///
    /// A lost document race reloads and merges again. Every operation gets a
    /// log entry with its outcome.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store fails or the document stays
    /// contended.
    #[tracing::instrument(skip(self, meeting_id, operations), fields(meeting_id = %meeting_id, count = operations.len()))]
    pub async fn apply_batch(
        &self,
        meeting_id: &MeetingId,
        operations: Vec<NoteOperationEnvelope>,
    ) -> Result<MergeOutcome> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let stored = self.load(meeting_id).await?;
            let outcome = self
                .engine
                .apply_batch(stored.document, operations.iter().cloned());

            if outcome.is_modified()
                && self
                    .save(meeting_id, &outcome.document, stored.version.as_deref())
                    .await?
                    .is_none()
            {
                record_cas_retry("document");
                tracing::debug!("note document changed concurrently; merging again");
                continue;
            }

            self.append_log(meeting_id, &outcome).await?;
            record_merge(
                outcome.applied.len(),
                outcome.conflicts.len(),
                outcome.rejected.len(),
            );
            return Ok(outcome);
        }

        Err(Error::storage(format!(
            "note document '{}' stayed contended after {MAX_CAS_ATTEMPTS} attempts",
            document_path(meeting_id)
        )))
    }

    async fn append_log(&self, meeting_id: &MeetingId, outcome: &MergeOutcome) -> Result<()> {
        let now = self.clock.now();
        let entries = outcome
            .applied
            .iter()
            .map(|a| {
                OperationLogEntry::new(
                    &a.operation,
                    OperationStatus::Applied,
                    a.resulting_version,
                    None,
                    now,
                )
            })
            .chain(outcome.conflicts.iter().map(|c| {
                OperationLogEntry::new(
                    &c.operation,
                    OperationStatus::Conflict,
                    c.actual_version,
                    Some(format!(
                        "expected version {} but note is at {}",
                        c.operation.expected_version, c.actual_version
                    )),
                    now,
                )
            }))
            .chain(outcome.rejected.iter().map(|r| {
                OperationLogEntry::new(
                    &r.operation,
                    OperationStatus::Rejected,
                    r.operation.expected_version,
                    Some(r.reason.clone()),
                    now,
                )
            }));

        for entry in entries {
            let path = operation_path(meeting_id, entry.server_sequence);
            if let WriteResult::PreconditionFailed { .. } =
                write_json(self.storage.as_ref(), &path, &entry, WritePrecondition::DoesNotExist)
                    .await?
            {
                tracing::debug!(
                    server_sequence = entry.server_sequence,
                    "operation already logged"
                );
            }
        }
        Ok(())
    }
}
