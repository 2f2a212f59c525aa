//! Client-facing event operations.
//!
//! Every `queue_*` call runs the same admission sequence before anything is
//! enqueued: payload validation, an active-session check, then the per-user
//! rate limit for the action. Accepted events return immediately; persistence
//! happens when the owning processor flushes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use huddle_batch::{
    BatchConfig, CoalescingBatchProcessor, FlushReport, NoteSequenceOrdered,
    PresenceLastWriteWins, TranscriptInterimReplacement,
};
use huddle_core::error::{Error, Result};
use huddle_core::events::{
    NoteOperation, NoteOperationEnvelope, PresenceStatus, PresenceUpdate, TranscriptChunk,
};
use huddle_core::storage::StorageBackend;
use huddle_core::{Clock, MeetingId, UserId};
use huddle_ledger::{RateLimitRule, RateLimiter};
use huddle_notes::{NoteBatchWriter, NoteStore, SequenceAllocator};

use crate::config::{BatchSettings, RateLimitSettings};
use crate::metrics::{record_offered, record_rejected};
use crate::sessions::MeetingSessions;
use crate::writers::{PresenceWriter, TranscriptWriter};

/// Rate-limit action for transcript fragments.
pub const TRANSCRIPT_ACTION: &str = "queue_transcript_chunk";

/// Rate-limit action for note operations.
pub const NOTE_ACTION: &str = "queue_note_operation";

/// Rate-limit action for presence changes.
pub const PRESENCE_ACTION: &str = "queue_presence_update";

/// Transcript fragment as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptChunkRequest {
    /// Meeting being transcribed.
    pub meeting_id: MeetingId,
    /// Identified speaker, if any.
    #[serde(default)]
    pub speaker_id: Option<UserId>,
    /// Recognized text.
    pub text: String,
    /// Recognizer confidence in `[0, 1]`.
    pub confidence: f64,
    /// Start offset in milliseconds.
    pub start_ms: u64,
    /// End offset in milliseconds.
    pub end_ms: u64,
    /// Whether the fragment is provisional.
    #[serde(default)]
    pub interim: bool,
}

impl From<TranscriptChunkRequest> for TranscriptChunk {
    fn from(request: TranscriptChunkRequest) -> Self {
        Self {
            meeting_id: request.meeting_id,
            speaker_id: request.speaker_id,
            text: request.text,
            confidence: request.confidence,
            start_ms: request.start_ms,
            end_ms: request.end_ms,
            interim: request.interim,
        }
    }
}

/// Note edit as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteOperationRequest {
    /// Meeting whose note is edited.
    pub meeting_id: MeetingId,
    /// Editing participant.
    pub actor: UserId,
    /// The edit.
    pub operation: NoteOperation,
    /// Client-side sequence number.
    pub client_sequence: u64,
    /// Document version the edit is based on.
    pub expected_version: u64,
}

/// Presence change as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRequest {
    /// Meeting the participant is in.
    pub meeting_id: MeetingId,
    /// The participant.
    pub user_id: UserId,
    /// New status.
    pub presence: PresenceStatus,
    /// Free-form client metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Response to a queued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueReceipt {
    /// Whether the event entered the queue.
    pub queued: bool,
    /// Queue depth after the call.
    pub batch_size: usize,
}

/// Response to a queued note operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteQueueReceipt {
    /// Whether the operation entered the queue.
    pub queued: bool,
    /// Queue depth after the call.
    pub batch_size: usize,
    /// Assigned position in the meeting's operation order. Absent when the
    /// queue was already shut down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_sequence: Option<u64>,
}

/// Depth of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorStats {
    /// Items waiting for a flush.
    pub queue_size: usize,
}

/// Depth of every queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Transcript queue.
    pub transcripts: ProcessorStats,
    /// Note operation queue.
    pub note_ops: ProcessorStats,
    /// Presence queue.
    pub presence: ProcessorStats,
}

/// Flush results for every queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushSummary {
    /// Transcript queue.
    pub transcripts: FlushReport,
    /// Note operation queue.
    pub note_ops: FlushReport,
    /// Presence queue.
    pub presence: FlushReport,
}

/// Owner of the three event processors and their admission checks.
pub struct EventHandlers {
    transcripts: CoalescingBatchProcessor<TranscriptChunk>,
    note_ops: CoalescingBatchProcessor<NoteOperationEnvelope>,
    presence: CoalescingBatchProcessor<PresenceUpdate>,
    sessions: Arc<dyn MeetingSessions>,
    rate_limiter: RateLimiter,
    rate_limits: RateLimitSettings,
    sequences: SequenceAllocator,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("transcripts", &self.transcripts)
            .field("note_ops", &self.note_ops)
            .field("presence", &self.presence)
            .field("rate_limits", &self.rate_limits)
            .finish_non_exhaustive()
    }
}

impl EventHandlers {
    /// Creates the processors and their writers.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn new(
        batch: &BatchSettings,
        rate_limits: RateLimitSettings,
        storage: Arc<dyn StorageBackend>,
        notes: NoteStore,
        sessions: Arc<dyn MeetingSessions>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Ok(Self {
            transcripts: CoalescingBatchProcessor::new(
                "transcripts",
                batch.transcripts.clone(),
                Arc::new(TranscriptInterimReplacement),
                Arc::new(TranscriptWriter::new(Arc::clone(&storage))),
            )?,
            note_ops: CoalescingBatchProcessor::new(
                "note_ops",
                batch.note_ops.clone(),
                Arc::new(NoteSequenceOrdered),
                Arc::new(NoteBatchWriter::new(notes)),
            )?,
            presence: CoalescingBatchProcessor::new(
                "presence",
                batch.presence.clone(),
                Arc::new(PresenceLastWriteWins),
                Arc::new(PresenceWriter::new(Arc::clone(&storage))),
            )?,
            sessions,
            rate_limiter: RateLimiter::new(Arc::clone(&storage)).with_clock(Arc::clone(&clock)),
            rate_limits,
            sequences: SequenceAllocator::new(storage),
            clock,
        })
    }

    /// Queues a transcript fragment.
    ///
    /// The rate-limit subject is the speaker, or the meeting for
    /// unattributed fragments.
    ///
    /// # Errors
    ///
    /// Returns `VALIDATION` for a malformed fragment, `PRECONDITION_FAILED`
    /// when the meeting is not active and `RATE_LIMIT_EXCEEDED` when the
    /// subject is over its limit.
    #[tracing::instrument(skip(self, request), fields(meeting_id = %request.meeting_id))]
    pub async fn queue_transcript_chunk(
        &self,
        request: TranscriptChunkRequest,
    ) -> Result<QueueReceipt> {
        let chunk = TranscriptChunk::from(request);
        let subject = chunk
            .speaker_id
            .as_ref()
            .map_or_else(|| chunk.meeting_id.to_string(), UserId::to_string);
        let admitted = async {
            chunk.validate()?;
            self.admit(
                &chunk.meeting_id,
                &subject,
                TRANSCRIPT_ACTION,
                self.rate_limits.transcripts,
            )
            .await
        }
        .await;
        reject_on_error("transcript", admitted)?;

        let outcome = self.transcripts.add(chunk)?;
        record_offered("transcript", outcome.accepted);
        Ok(QueueReceipt {
            queued: outcome.accepted,
            batch_size: outcome.queue_depth,
        })
    }

    /// Stamps a note operation with the next server sequence and queues it.
    ///
    /// # Errors
    ///
    /// Same admission errors as [`EventHandlers::queue_transcript_chunk`],
    /// with the actor as rate-limit subject.
    #[tracing::instrument(
        skip(self, request),
        fields(meeting_id = %request.meeting_id, actor = %request.actor)
    )]
    pub async fn queue_note_operation(
        &self,
        request: NoteOperationRequest,
    ) -> Result<NoteQueueReceipt> {
        let admitted = async {
            request.operation.validate()?;
            self.admit(
                &request.meeting_id,
                request.actor.as_str(),
                NOTE_ACTION,
                self.rate_limits.note_ops,
            )
            .await
        }
        .await;
        reject_on_error("note_operation", admitted)?;

        if self.note_ops.is_shut_down()? {
            record_offered("note_operation", false);
            return Ok(NoteQueueReceipt {
                queued: false,
                batch_size: self.note_ops.queue_size()?,
                server_sequence: None,
            });
        }

        let server_sequence = self.sequences.next(&request.meeting_id).await?;
        let outcome = self.note_ops.add(NoteOperationEnvelope {
            meeting_id: request.meeting_id,
            actor: request.actor,
            operation: request.operation,
            client_sequence: request.client_sequence,
            server_sequence,
            expected_version: request.expected_version,
        })?;
        record_offered("note_operation", outcome.accepted);
        Ok(NoteQueueReceipt {
            queued: outcome.accepted,
            batch_size: outcome.queue_depth,
            server_sequence: outcome.accepted.then_some(server_sequence),
        })
    }

    /// Queues a presence change stamped with the current time.
    ///
    /// # Errors
    ///
    /// Same admission errors as [`EventHandlers::queue_transcript_chunk`],
    /// with the participant as rate-limit subject.
    #[tracing::instrument(
        skip(self, request),
        fields(meeting_id = %request.meeting_id, user_id = %request.user_id)
    )]
    pub async fn queue_presence_update(&self, request: PresenceRequest) -> Result<QueueReceipt> {
        let admitted = self
            .admit(
                &request.meeting_id,
                request.user_id.as_str(),
                PRESENCE_ACTION,
                self.rate_limits.presence,
            )
            .await;
        reject_on_error("presence", admitted)?;

        let outcome = self.presence.add(PresenceUpdate {
            meeting_id: request.meeting_id,
            user_id: request.user_id,
            status: request.presence,
            metadata: request.metadata,
            timestamp: self.clock.now(),
        })?;
        record_offered("presence", outcome.accepted);
        Ok(QueueReceipt {
            queued: outcome.accepted,
            batch_size: outcome.queue_depth,
        })
    }

    /// Drains every queue now. Calling it with empty queues is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if a processor lock is poisoned.
    pub async fn flush_all_queues(&self) -> Result<FlushSummary> {
        let (transcripts, note_ops, presence) = tokio::join!(
            self.transcripts.flush(),
            self.note_ops.flush(),
            self.presence.flush()
        );
        Ok(FlushSummary {
            transcripts: transcripts?,
            note_ops: note_ops?,
            presence: presence?,
        })
    }

    /// Returns the depth of every queue.
    ///
    /// # Errors
    ///
    /// Returns an error if a processor lock is poisoned.
    pub fn get_queue_stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            transcripts: ProcessorStats {
                queue_size: self.transcripts.queue_size()?,
            },
            note_ops: ProcessorStats {
                queue_size: self.note_ops.queue_size()?,
            },
            presence: ProcessorStats {
                queue_size: self.presence.queue_size()?,
            },
        })
    }

    /// Stops every processor after a final flush. Later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns an error if a processor lock is poisoned.
    pub async fn shutdown(&self) -> Result<FlushSummary> {
        let (transcripts, note_ops, presence) = tokio::join!(
            self.transcripts.shutdown(),
            self.note_ops.shutdown(),
            self.presence.shutdown()
        );
        Ok(FlushSummary {
            transcripts: transcripts?,
            note_ops: note_ops?,
            presence: presence?,
        })
    }

    /// Returns the configured flush thresholds of each queue.
    #[must_use]
    pub fn batch_configs(&self) -> [(&str, &BatchConfig); 3] {
        [
            (self.transcripts.name(), self.transcripts.config()),
            (self.note_ops.name(), self.note_ops.config()),
            (self.presence.name(), self.presence.config()),
        ]
    }

    async fn admit(
        &self,
        meeting_id: &MeetingId,
        subject: &str,
        action: &str,
        rule: RateLimitRule,
    ) -> Result<()> {
        if !self.sessions.is_active(meeting_id).await? {
            return Err(Error::precondition(format!(
                "meeting {meeting_id} has no active session"
            )));
        }
        if self.rate_limits.enabled {
            self.rate_limiter.enforce_rule(subject, action, rule).await?;
        }
        Ok(())
    }
}

fn reject_on_error(kind: &'static str, result: Result<()>) -> Result<()> {
    if let Err(err) = &result {
        record_rejected(kind, err.code());
        tracing::debug!(kind, code = %err.code(), error = %err, "event rejected");
    }
    result
}
