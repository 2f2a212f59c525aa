//! Version-gated merge of queued note operations.
//!
//! A batch is applied in ascending server sequence. Each operation must name
//! the document version it was based on; a mismatch is recorded as a
//! `VERSION_CONFLICT` and skipped so the client can rebase and resubmit.
//! There is no positional transform of conflicting edits.

use serde::Serialize;

use huddle_core::error::{Error, ErrorCode, Result};
use huddle_core::events::{NoteOperation, NoteOperationEnvelope};

use crate::document::NoteDocument;

/// Default upper bound on document length, in characters.
pub const DEFAULT_MAX_DOCUMENT_CHARS: usize = 1_000_000;

/// An operation skipped because the document moved on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionConflict {
    /// The skipped operation.
    pub operation: NoteOperationEnvelope,
    /// Document version when the operation was considered.
    pub actual_version: u64,
}

impl VersionConflict {
    /// Returns the error code reported to the client.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::VersionConflict
    }
}

/// An operation skipped because it could not apply to the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedOperation {
    /// The skipped operation.
    pub operation: NoteOperationEnvelope,
    /// Why it was rejected.
    pub reason: String,
}

/// An applied operation with the version it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedOperation {
    /// The operation.
    pub operation: NoteOperationEnvelope,
    /// Document version after applying it.
    pub resulting_version: u64,
}

/// Result of merging one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Document after every applicable operation.
    pub document: NoteDocument,
    /// Applied operations in application order.
    pub applied: Vec<AppliedOperation>,
    /// Operations skipped on a version mismatch.
    pub conflicts: Vec<VersionConflict>,
    /// Operations skipped as malformed or out of range.
    pub rejected: Vec<RejectedOperation>,
}

impl MergeOutcome {
    /// Returns `true` if the document changed version.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        !self.applied.is_empty()
    }
}

/// Applies note operation batches to documents.
#[derive(Debug, Clone, Copy)]
pub struct MergeEngine {
    max_document_chars: usize,
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self {
            max_document_chars: DEFAULT_MAX_DOCUMENT_CHARS,
        }
    }
}

impl MergeEngine {
    /// Creates an engine that rejects edits growing a note past `max_document_chars`.
    #[must_use]
    pub const fn new(max_document_chars: usize) -> Self {
        Self { max_document_chars }
    }

    /// Rejects an insert that would grow the note past the limit.
    fn check_size(&self, document: &NoteDocument, operation: &NoteOperation) -> Result<()> {
        let NoteOperation::Insert { text, .. } = operation else {
            return Ok(());
        };
        // Byte length bounds char length, so most inserts skip the count.
        if document.content.len() + text.len() <= self.max_document_chars {
            return Ok(());
        }
        if document.char_len() + text.chars().count() > self.max_document_chars {
            return Err(Error::validation(format!(
                "note would exceed {} characters",
                self.max_document_chars
            )));
        }
        Ok(())
    }

    /// Applies `operations` to `document` in ascending server sequence.
    #[must_use]
    pub fn apply_batch(
        &self,
        mut document: NoteDocument,
        operations: impl IntoIterator<Item = NoteOperationEnvelope>,
    ) -> MergeOutcome {
        let mut operations: Vec<_> = operations.into_iter().collect();
        operations.sort_by_key(|op| op.server_sequence);

        let mut applied = Vec::new();
        let mut conflicts = Vec::new();
        let mut rejected = Vec::new();

        for envelope in operations {
            if envelope.expected_version != document.version {
                tracing::debug!(
                    server_sequence = envelope.server_sequence,
                    expected_version = envelope.expected_version,
                    actual_version = document.version,
                    "note operation conflicts with current version"
                );
                conflicts.push(VersionConflict {
                    operation: envelope,
                    actual_version: document.version,
                });
                continue;
            }

            let result = self
                .check_size(&document, &envelope.operation)
                .and_then(|()| document.apply(&envelope.operation));

            match result {
                Ok(()) => {
                    applied.push(AppliedOperation {
                        operation: envelope,
                        resulting_version: document.version,
                    });
                }
                Err(e) => rejected.push(RejectedOperation {
                    operation: envelope,
                    reason: e.to_string(),
                }),
            }
        }

        MergeOutcome {
            document,
            applied,
            conflicts,
            rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_test_utils::fixtures::{delete, insert, note_op};

    #[test]
    fn sequential_inserts_build_on_each_other() {
        let engine = MergeEngine::default();
        let outcome = engine.apply_batch(
            NoteDocument::new("HelloWorld"),
            vec![
                note_op("m1", "u1", insert(5, "AB"), 1, 0),
                note_op("m1", "u2", insert(7, "CD"), 2, 1),
            ],
        );

        assert_eq!(outcome.document.content, "HelloABCDWorld");
        assert_eq!(outcome.document.version, 2);
        assert_eq!(outcome.applied.len(), 2);
        assert_eq!(outcome.applied[1].resulting_version, 2);
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn stale_expected_version_is_a_conflict() {
        let engine = MergeEngine::default();
        let outcome = engine.apply_batch(
            NoteDocument::new("HelloWorld"),
            vec![
                note_op("m1", "u1", insert(5, "AB"), 1, 0),
                note_op("m1", "u2", delete(0, 5), 2, 0),
            ],
        );

        assert_eq!(outcome.document.content, "HelloABWorld");
        assert_eq!(outcome.document.version, 1);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].actual_version, 1);
        assert_eq!(outcome.conflicts[0].code(), ErrorCode::VersionConflict);
    }

    #[test]
    fn applies_in_server_sequence_order() {
        let engine = MergeEngine::default();
        let outcome = engine.apply_batch(
            NoteDocument::new(""),
            vec![
                note_op("m1", "u1", insert(1, "b"), 8, 1),
                note_op("m1", "u1", insert(0, "a"), 3, 0),
            ],
        );
        assert_eq!(outcome.document.content, "ab");
        assert_eq!(
            outcome
                .applied
                .iter()
                .map(|a| a.operation.server_sequence)
                .collect::<Vec<_>>(),
            vec![3, 8]
        );
    }

    #[test]
    fn out_of_range_is_rejected_without_consuming_version() {
        let engine = MergeEngine::default();
        let outcome = engine.apply_batch(
            NoteDocument::new("abc"),
            vec![
                note_op("m1", "u1", delete(2, 5), 1, 0),
                note_op("m1", "u1", insert(3, "d"), 2, 0),
            ],
        );
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.document.content, "abcd");
        assert_eq!(outcome.document.version, 1);
    }

    #[test]
    fn size_limit_counts_chars_and_keeps_later_edits() {
        let engine = MergeEngine::new(4);
        let outcome = engine.apply_batch(
            NoteDocument::new("ab"),
            vec![
                note_op("m1", "u1", insert(2, "éé"), 1, 0),
                note_op("m1", "u1", insert(0, "xyz"), 2, 1),
                note_op("m1", "u1", delete(0, 1), 3, 1),
            ],
        );
        assert_eq!(outcome.applied.len(), 2);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.document.content, "béé");
        assert_eq!(outcome.document.version, 2);
    }

    #[test]
    fn size_limit_rejects_growth() {
        let engine = MergeEngine::new(4);
        let outcome = engine.apply_batch(
            NoteDocument::new("abc"),
            vec![note_op("m1", "u1", insert(0, "xy"), 1, 0)],
        );
        assert_eq!(outcome.rejected.len(), 1);
        assert!(!outcome.is_modified());
    }
}
