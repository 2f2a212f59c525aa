//! Batch writer that merges flushed note operations into documents.

use async_trait::async_trait;
use tracing::Instrument;

use huddle_batch::BatchWriter;
use huddle_core::error::Result;
use huddle_core::events::NoteOperationEnvelope;
use huddle_core::observability::meeting_span;

use crate::store::NoteStore;

/// Applies each flushed meeting group through the [`NoteStore`].
///
/// Version conflicts and rejected operations are logged and recorded in the
/// operation log; only storage failures fail the group.
#[derive(Debug, Clone)]
pub struct NoteBatchWriter {
    store: NoteStore,
}

impl NoteBatchWriter {
    /// Creates a writer over `store`.
    #[must_use]
    pub const fn new(store: NoteStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchWriter<NoteOperationEnvelope> for NoteBatchWriter {
    async fn write_batch(&self, group: &str, items: &[NoteOperationEnvelope]) -> Result<()> {
        let Some(first) = items.first() else {
            return Ok(());
        };
        let meeting_id = first.meeting_id.clone();

        async {
            let outcome = self.store.apply_batch(&meeting_id, items.to_vec()).await?;
            for conflict in &outcome.conflicts {
                tracing::warn!(
                    code = %conflict.code(),
                    actor = %conflict.operation.actor,
                    server_sequence = conflict.operation.server_sequence,
                    expected_version = conflict.operation.expected_version,
                    actual_version = conflict.actual_version,
                    "note operation skipped"
                );
            }
            for rejected in &outcome.rejected {
                tracing::warn!(
                    actor = %rejected.operation.actor,
                    server_sequence = rejected.operation.server_sequence,
                    reason = %rejected.reason,
                    "note operation rejected"
                );
            }
            tracing::debug!(
                applied = outcome.applied.len(),
                version = outcome.document.version,
                "note batch merged"
            );
            Ok::<_, huddle_core::Error>(())
        }
        .instrument(meeting_span("merge_notes", group))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_test_utils::TracingMemoryBackend;
    use huddle_test_utils::fixtures::{insert, meeting, note_op};
    use std::sync::Arc;

    #[tokio::test]
    async fn writes_group_through_store() -> Result<()> {
        let storage = TracingMemoryBackend::new();
        let store = NoteStore::new(Arc::new(storage.clone()));
        let writer = NoteBatchWriter::new(store.clone());

        writer
            .write_batch(
                "m1",
                &[
                    note_op("m1", "u1", insert(0, "Hello"), 1, 0),
                    note_op("m1", "u2", insert(0, "Hey"), 2, 0),
                ],
            )
            .await?;

        let stored = store.load(&meeting("m1")).await?;
        assert_eq!(stored.document.content, "Hello");
        assert_eq!(stored.document.version, 1);
        assert_eq!(storage.puts_under("notes/m1/ops/").len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn empty_group_is_noop() -> Result<()> {
        let storage = TracingMemoryBackend::new();
        let writer = NoteBatchWriter::new(NoteStore::new(Arc::new(storage.clone())));
        writer.write_batch("m1", &[]).await?;
        assert!(storage.operations().is_empty());
        Ok(())
    }
}
