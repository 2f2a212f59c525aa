//! High-frequency client event payloads.
//!
//! These are the items that flow through the batch processors: transcript
//! fragments, presence changes and collaborative note operations. They are
//! plain serde types; coalescing and persistence live in the crates that
//! consume them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{MeetingId, UserId};

/// A fragment of live transcription.
///
/// Interim fragments are provisional and superseded by later interim
/// fragments for the same time range; finalized fragments are durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptChunk {
    /// Meeting the fragment belongs to.
    pub meeting_id: MeetingId,
    /// Speaker, when diarization identified one.
    pub speaker_id: Option<UserId>,
    /// Recognized text.
    pub text: String,
    /// Recognizer confidence in `[0, 1]`.
    pub confidence: f64,
    /// Start offset from meeting start, in milliseconds.
    pub start_ms: u64,
    /// End offset from meeting start, in milliseconds.
    pub end_ms: u64,
    /// Whether the fragment is provisional.
    pub interim: bool,
}

impl TranscriptChunk {
    /// Checks field-level invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for empty text, a confidence outside
    /// `[0, 1]`, or a time range that ends before it starts.
    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(Error::validation("transcript text cannot be empty"));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::validation(format!(
                "confidence {} is outside [0, 1]",
                self.confidence
            )));
        }
        if self.end_ms < self.start_ms {
            return Err(Error::validation(format!(
                "transcript range ends ({}) before it starts ({})",
                self.end_ms, self.start_ms
            )));
        }
        Ok(())
    }

    /// Returns `true` if both fragments cover a common instant.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start_ms <= other.end_ms && other.start_ms <= self.end_ms
    }
}

/// Participant presence transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    /// The participant joined the meeting.
    Joined,
    /// The participant left the meeting.
    Left,
}

impl PresenceStatus {
    /// Returns the status as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Joined => "joined",
            Self::Left => "left",
        }
    }
}

/// A presence change for one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    /// Meeting the participant is in.
    pub meeting_id: MeetingId,
    /// The participant.
    pub user_id: UserId,
    /// New status.
    pub status: PresenceStatus,
    /// Free-form client metadata (device, network quality, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// When the client observed the change.
    pub timestamp: DateTime<Utc>,
}

/// An edit to a collaborative note.
///
/// Positions and lengths count Unicode scalar values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NoteOperation {
    /// Splice `text` in at `position`.
    Insert {
        /// Insertion offset.
        position: usize,
        /// Text to insert.
        text: String,
    },
    /// Remove `length` characters starting at `position`.
    Delete {
        /// First removed offset.
        position: usize,
        /// Number of characters removed.
        length: usize,
    },
    /// Keep `length` characters unchanged. Advances the version only.
    Retain {
        /// Number of characters retained.
        length: usize,
    },
}

impl NoteOperation {
    /// Returns the operation kind as a string.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Delete { .. } => "delete",
            Self::Retain { .. } => "retain",
        }
    }

    /// Checks operation-local invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for empty inserts or zero-length deletes.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Insert { text, .. } if text.is_empty() => {
                Err(Error::validation("insert text cannot be empty"))
            }
            Self::Delete { length: 0, .. } => {
                Err(Error::validation("delete length must be positive"))
            }
            _ => Ok(()),
        }
    }
}

/// A note operation with its ordering and concurrency metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteOperationEnvelope {
    /// Meeting whose note is edited.
    pub meeting_id: MeetingId,
    /// Editing participant.
    pub actor: UserId,
    /// The edit.
    pub operation: NoteOperation,
    /// Client-side sequence number, kept for diagnostics.
    pub client_sequence: u64,
    /// Server-assigned sequence number; defines application order.
    pub server_sequence: u64,
    /// Document version the client based the edit on.
    pub expected_version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(start_ms: u64, end_ms: u64) -> TranscriptChunk {
        TranscriptChunk {
            meeting_id: MeetingId::new_unchecked("m1"),
            speaker_id: None,
            text: "hello".into(),
            confidence: 0.9,
            start_ms,
            end_ms,
            interim: false,
        }
    }

    #[test]
    fn transcript_validation() {
        assert!(chunk(0, 10).validate().is_ok());
        assert!(chunk(10, 5).validate().is_err());

        let mut low = chunk(0, 10);
        low.confidence = 1.5;
        assert!(low.validate().is_err());

        let mut blank = chunk(0, 10);
        blank.text = "  ".into();
        assert!(blank.validate().is_err());
    }

    #[test]
    fn transcript_overlap_is_inclusive() {
        assert!(chunk(0, 100).overlaps(&chunk(100, 200)));
        assert!(chunk(50, 60).overlaps(&chunk(0, 100)));
        assert!(!chunk(0, 99).overlaps(&chunk(100, 200)));
    }

    #[test]
    fn note_operations_use_tagged_wire_format() {
        let op = NoteOperation::Insert {
            position: 5,
            text: "AB".into(),
        };
        let json = serde_json::to_value(&op).expect("encode");
        assert_eq!(json["type"], "insert");
        assert_eq!(json["position"], 5);

        let decoded: NoteOperation =
            serde_json::from_str(r#"{"type":"delete","position":1,"length":2}"#).expect("decode");
        assert_eq!(
            decoded,
            NoteOperation::Delete {
                position: 1,
                length: 2
            }
        );
        assert!(serde_json::from_str::<NoteOperation>(r#"{"type":"move"}"#).is_err());
    }

    #[test]
    fn note_operation_validation() {
        assert!(
            NoteOperation::Insert {
                position: 0,
                text: String::new()
            }
            .validate()
            .is_err()
        );
        assert!(
            NoteOperation::Delete {
                position: 0,
                length: 0
            }
            .validate()
            .is_err()
        );
        assert!(NoteOperation::Retain { length: 0 }.validate().is_ok());
    }
}
