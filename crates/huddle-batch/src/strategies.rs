//! Merge strategies for the three high-frequency event classes.

use huddle_core::events::{NoteOperationEnvelope, PresenceUpdate, TranscriptChunk};

use crate::coalesce::{CoalescingRule, Merged};

/// Presence: last write wins per `(meeting, user)`.
///
/// The update with the greatest client timestamp survives. On equal
/// timestamps the later-enqueued update wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct PresenceLastWriteWins;

impl CoalescingRule<PresenceUpdate> for PresenceLastWriteWins {
    fn name(&self) -> &'static str {
        "presence"
    }

    fn group_key(&self, item: &PresenceUpdate) -> String {
        item.meeting_id.to_string()
    }

    fn coalesce_key(&self, item: &PresenceUpdate) -> Option<String> {
        Some(format!("{}/{}", item.meeting_id, item.user_id))
    }

    fn merge(&self, existing: PresenceUpdate, incoming: PresenceUpdate) -> Merged<PresenceUpdate> {
        if incoming.timestamp >= existing.timestamp {
            Merged::One(incoming)
        } else {
            Merged::One(existing)
        }
    }
}

/// Transcript: interim fragments are replaced, finalized fragments are kept.
///
/// Interim fragments with the same speaker and start offset describe the
/// same utterance as it is being recognized; only the latest is kept. Any
/// interim fragment overlapping a finalized fragment of the same speaker is
/// superseded and dropped. Survivors are ordered by time range.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranscriptInterimReplacement;

fn speaker_key(chunk: &TranscriptChunk) -> &str {
    chunk.speaker_id.as_ref().map_or("-", |s| s.as_str())
}

impl CoalescingRule<TranscriptChunk> for TranscriptInterimReplacement {
    fn name(&self) -> &'static str {
        "transcript"
    }

    fn group_key(&self, item: &TranscriptChunk) -> String {
        item.meeting_id.to_string()
    }

    fn coalesce_key(&self, item: &TranscriptChunk) -> Option<String> {
        item.interim
            .then(|| format!("{}/{}/{}", item.meeting_id, speaker_key(item), item.start_ms))
    }

    fn merge(&self, _existing: TranscriptChunk, incoming: TranscriptChunk) -> Merged<TranscriptChunk> {
        Merged::One(incoming)
    }

    fn finish(&self, items: &mut Vec<TranscriptChunk>) {
        let finals: Vec<(String, u64, u64)> = items
            .iter()
            .filter(|c| !c.interim)
            .map(|c| (speaker_key(c).to_string(), c.start_ms, c.end_ms))
            .collect();

        items.retain(|chunk| {
            !chunk.interim
                || !finals.iter().any(|(speaker, start, end)| {
                    speaker == speaker_key(chunk) && chunk.start_ms <= *end && *start <= chunk.end_ms
                })
        });
        items.sort_by_key(|c| (c.start_ms, c.end_ms));
    }
}

/// Note operations: never collapse, apply in server-sequence order.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoteSequenceOrdered;

impl CoalescingRule<NoteOperationEnvelope> for NoteSequenceOrdered {
    fn name(&self) -> &'static str {
        "note_ops"
    }

    fn group_key(&self, item: &NoteOperationEnvelope) -> String {
        item.meeting_id.to_string()
    }

    fn coalesce_key(&self, _item: &NoteOperationEnvelope) -> Option<String> {
        None
    }

    fn merge(
        &self,
        existing: NoteOperationEnvelope,
        incoming: NoteOperationEnvelope,
    ) -> Merged<NoteOperationEnvelope> {
        Merged::Both(existing, incoming)
    }

    fn finish(&self, items: &mut Vec<NoteOperationEnvelope>) {
        items.sort_by_key(|op| op.server_sequence);
    }
}
