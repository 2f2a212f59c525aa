//! Builders for meeting events used across test suites.

use chrono::{DateTime, TimeZone, Utc};
use huddle_core::events::{
    NoteOperation, NoteOperationEnvelope, PresenceStatus, PresenceUpdate, TranscriptChunk,
};
use huddle_core::id::{MeetingId, UserId};

/// Fixed instant offset by `secs` seconds, for deterministic timestamps.
pub fn at_secs(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .expect("valid timestamp")
}

/// Meeting id from a literal.
pub fn meeting(id: &str) -> MeetingId {
    MeetingId::new(id).expect("valid meeting id")
}

/// User id from a literal.
pub fn user(id: &str) -> UserId {
    UserId::new(id).expect("valid user id")
}

/// Presence update with the given status at `secs`.
pub fn presence(meeting_id: &str, user_id: &str, status: PresenceStatus, secs: i64) -> PresenceUpdate {
    PresenceUpdate {
        meeting_id: meeting(meeting_id),
        user_id: user(user_id),
        status,
        metadata: None,
        timestamp: at_secs(secs),
    }
}

/// `joined` presence update at `secs`.
pub fn joined(meeting_id: &str, user_id: &str, secs: i64) -> PresenceUpdate {
    presence(meeting_id, user_id, PresenceStatus::Joined, secs)
}

/// `left` presence update at `secs`.
pub fn left(meeting_id: &str, user_id: &str, secs: i64) -> PresenceUpdate {
    presence(meeting_id, user_id, PresenceStatus::Left, secs)
}

/// Transcript fragment with full confidence.
pub fn transcript(
    meeting_id: &str,
    speaker: Option<&str>,
    text: &str,
    start_ms: u64,
    end_ms: u64,
    interim: bool,
) -> TranscriptChunk {
    TranscriptChunk {
        meeting_id: meeting(meeting_id),
        speaker_id: speaker.map(user),
        text: text.to_string(),
        confidence: 1.0,
        start_ms,
        end_ms,
        interim,
    }
}

/// Note operation envelope; the client sequence mirrors the server sequence.
pub fn note_op(
    meeting_id: &str,
    actor: &str,
    operation: NoteOperation,
    server_sequence: u64,
    expected_version: u64,
) -> NoteOperationEnvelope {
    NoteOperationEnvelope {
        meeting_id: meeting(meeting_id),
        actor: user(actor),
        operation,
        client_sequence: server_sequence,
        server_sequence,
        expected_version,
    }
}

/// `Insert` operation.
pub fn insert(position: usize, text: &str) -> NoteOperation {
    NoteOperation::Insert {
        position,
        text: text.to_string(),
    }
}

/// `Delete` operation.
pub fn delete(position: usize, length: usize) -> NoteOperation {
    NoteOperation::Delete { position, length }
}
