//! Flush writers that persist transcript fragments and presence per meeting.
//!
//! Storage layout:
//!
//! ```text
//! transcripts/{meeting}/{speaker}/{start_ms:012}.interim.json
//! transcripts/{meeting}/{speaker}/{start_ms:012}.final.json
//! presence/{meeting}/{user}.json
//! ```
//!
//! A finalized fragment removes the interim object for the same speaker and
//! start. Presence keeps the newest state per participant across flushes.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use huddle_batch::BatchWriter;
use huddle_core::error::{Error, Result};
use huddle_core::events::{PresenceUpdate, TranscriptChunk};
use huddle_core::observability::meeting_span;
use huddle_core::storage::{StorageBackend, WritePrecondition, read_json, write_json};
use huddle_core::{MeetingId, UserId};

use crate::metrics::{record_persisted, record_stale_presence};

/// Prefix for persisted transcript fragments.
pub const TRANSCRIPTS_PREFIX: &str = "transcripts";

/// Prefix for persisted presence state.
pub const PRESENCE_PREFIX: &str = "presence";

const PRESENCE_CAS_ATTEMPTS: usize = 5;

const UNATTRIBUTED_SPEAKER: &str = "unattributed";

/// Returns the storage path of a transcript fragment.
#[must_use]
pub fn transcript_path(chunk: &TranscriptChunk) -> String {
    fragment_path(chunk, chunk.interim)
}

fn fragment_path(chunk: &TranscriptChunk, interim: bool) -> String {
    let speaker = chunk
        .speaker_id
        .as_ref()
        .map_or(UNATTRIBUTED_SPEAKER, UserId::as_str);
    let kind = if interim { "interim" } else { "final" };
    format!(
        "{TRANSCRIPTS_PREFIX}/{}/{speaker}/{:012}.{kind}.json",
        chunk.meeting_id, chunk.start_ms
    )
}

/// Returns the storage path of one participant's presence.
#[must_use]
pub fn presence_path(meeting_id: &MeetingId, user_id: &UserId) -> String {
    format!("{PRESENCE_PREFIX}/{meeting_id}/{user_id}.json")
}

/// Persists flushed transcript fragments.
#[derive(Clone)]
pub struct TranscriptWriter {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for TranscriptWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptWriter").finish_non_exhaustive()
    }
}

impl TranscriptWriter {
    /// Creates a writer over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl BatchWriter<TranscriptChunk> for TranscriptWriter {
    async fn write_batch(&self, group: &str, items: &[TranscriptChunk]) -> Result<()> {
        async {
            for chunk in items {
                write_json(
                    self.storage.as_ref(),
                    &transcript_path(chunk),
                    chunk,
                    WritePrecondition::None,
                )
                .await?;
                if !chunk.interim {
                    self.storage.delete(&fragment_path(chunk, true)).await?;
                }
            }
            record_persisted("transcript", items.len());
            tracing::debug!(fragments = items.len(), "transcript batch persisted");
            Ok::<_, Error>(())
        }
        .instrument(meeting_span("persist_transcripts", group))
        .await
    }
}

/// Persists the latest presence state per participant.
#[derive(Clone)]
pub struct PresenceWriter {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for PresenceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceWriter").finish_non_exhaustive()
    }
}

impl PresenceWriter {
    /// Creates a writer over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Reads the stored presence of one participant.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or decode fails.
    pub async fn current(
        &self,
        meeting_id: &MeetingId,
        user_id: &UserId,
    ) -> Result<Option<PresenceUpdate>> {
        Ok(
            read_json::<PresenceUpdate, _>(self.storage.as_ref(), &presence_path(meeting_id, user_id))
                .await?
                .map(|(update, _)| update),
        )
    }

    /// Stores `update` unless a newer state is already persisted.
    ///
    /// Returns `false` when the update was stale.
    async fn store(&self, update: &PresenceUpdate) -> Result<bool> {
        let path = presence_path(&update.meeting_id, &update.user_id);
        for _ in 0..PRESENCE_CAS_ATTEMPTS {
            let precondition =
                match read_json::<PresenceUpdate, _>(self.storage.as_ref(), &path).await? {
                    Some((stored, _)) if stored.timestamp > update.timestamp => return Ok(false),
                    Some((_, version)) => WritePrecondition::MatchesVersion(version),
                    None => WritePrecondition::DoesNotExist,
                };
            if write_json(self.storage.as_ref(), &path, update, precondition)
                .await?
                .is_success()
            {
                return Ok(true);
            }
        }
        Err(Error::storage(format!(
            "presence for {} kept changing during write",
            update.user_id
        )))
    }
}

#[async_trait]
impl BatchWriter<PresenceUpdate> for PresenceWriter {
    async fn write_batch(&self, group: &str, items: &[PresenceUpdate]) -> Result<()> {
        async {
            let mut stored = 0;
            for update in items {
                if self.store(update).await? {
                    stored += 1;
                } else {
                    record_stale_presence();
                    tracing::debug!(user_id = %update.user_id, "stale presence update dropped");
                }
            }
            record_persisted("presence", stored);
            Ok::<_, Error>(())
        }
        .instrument(meeting_span("persist_presence", group))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::events::PresenceStatus;
    use huddle_test_utils::TracingMemoryBackend;
    use huddle_test_utils::fixtures::{joined, left, meeting, transcript, user};

    #[tokio::test]
    async fn final_fragment_replaces_interim() -> Result<()> {
        let storage = TracingMemoryBackend::new();
        let writer = TranscriptWriter::new(Arc::new(storage.clone()));

        writer
            .write_batch("m1", &[transcript("m1", Some("u1"), "hel", 0, 500, true)])
            .await?;
        assert!(
            storage
                .raw("transcripts/m1/u1/000000000000.interim.json")
                .is_some()
        );

        writer
            .write_batch("m1", &[transcript("m1", Some("u1"), "hello", 0, 800, false)])
            .await?;
        assert_eq!(storage.paths(), vec!["transcripts/m1/u1/000000000000.final.json"]);
        let stored = storage
            .raw_json("transcripts/m1/u1/000000000000.final.json")
            .expect("final stored");
        assert_eq!(stored["text"], "hello");
        Ok(())
    }

    #[tokio::test]
    async fn unattributed_fragments_use_placeholder_speaker() -> Result<()> {
        let storage = TracingMemoryBackend::new();
        let writer = TranscriptWriter::new(Arc::new(storage.clone()));
        writer
            .write_batch("m1", &[transcript("m1", None, "hi", 1_000, 1_200, false)])
            .await?;
        assert_eq!(
            storage.paths(),
            vec!["transcripts/m1/unattributed/000000001000.final.json"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn presence_keeps_newest_state() -> Result<()> {
        let storage = TracingMemoryBackend::new();
        let writer = PresenceWriter::new(Arc::new(storage.clone()));

        writer.write_batch("m1", &[left("m1", "u1", 20)]).await?;
        writer.write_batch("m1", &[joined("m1", "u1", 10)]).await?;

        let current = writer.current(&meeting("m1"), &user("u1")).await?;
        assert_eq!(current.map(|p| p.status), Some(PresenceStatus::Left));
        Ok(())
    }

    #[tokio::test]
    async fn presence_write_failure_fails_group() {
        let storage = TracingMemoryBackend::new();
        storage.inject_failure("presence/m1/");
        let writer = PresenceWriter::new(Arc::new(storage.clone()));

        let err = writer
            .write_batch("m1", &[joined("m1", "u1", 0)])
            .await
            .unwrap_err();
        assert_eq!(err.code(), huddle_core::ErrorCode::Storage);
    }
}
