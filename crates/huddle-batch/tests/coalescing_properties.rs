//! Property-based tests for the coalescing strategies.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;

use proptest::prelude::*;

use huddle_batch::{NoteSequenceOrdered, PresenceLastWriteWins, TranscriptInterimReplacement, coalesce};
use huddle_core::events::{PresenceStatus, PresenceUpdate, TranscriptChunk};
use huddle_test_utils::fixtures::{insert, note_op, presence, transcript};

fn arb_presence() -> impl Strategy<Value = PresenceUpdate> {
    (
        prop::sample::select(vec!["m1", "m2"]),
        prop::sample::select(vec!["u1", "u2", "u3"]),
        prop::bool::ANY,
        0i64..20,
    )
        .prop_map(|(m, u, joined, secs)| {
            let status = if joined {
                PresenceStatus::Joined
            } else {
                PresenceStatus::Left
            };
            presence(m, u, status, secs)
        })
}

fn arb_transcript() -> impl Strategy<Value = TranscriptChunk> {
    (
        prop::sample::select(vec![Some("u1"), Some("u2"), None]),
        0u64..10,
        1u64..4,
        prop::bool::ANY,
    )
        .prop_map(|(speaker, start, len, interim)| {
            transcript("m1", speaker, "words", start * 100, (start + len) * 100, interim)
        })
}

proptest! {
    #[test]
    fn presence_keeps_one_latest_update_per_participant(
        updates in prop::collection::vec(arb_presence(), 0..40),
    ) {
        let mut latest: HashMap<(String, String), (usize, PresenceUpdate)> = HashMap::new();
        for (i, update) in updates.iter().enumerate() {
            let key = (update.meeting_id.to_string(), update.user_id.to_string());
            let replace = latest
                .get(&key)
                .is_none_or(|(_, seen)| update.timestamp >= seen.timestamp);
            if replace {
                latest.insert(key, (i, update.clone()));
            }
        }

        let batch = coalesce(&PresenceLastWriteWins, updates.clone());
        prop_assert_eq!(batch.input_len, updates.len());
        prop_assert_eq!(batch.output_len(), latest.len());

        for group in &batch.groups {
            for item in &group.items {
                prop_assert_eq!(group.key.as_str(), item.meeting_id.as_str());
                let key = (item.meeting_id.to_string(), item.user_id.to_string());
                let (_, expected) = &latest[&key];
                prop_assert_eq!(item, expected);
            }
        }
    }

    #[test]
    fn transcripts_keep_finals_and_drop_superseded_interims(
        chunks in prop::collection::vec(arb_transcript(), 0..30),
    ) {
        let finals = chunks.iter().filter(|c| !c.interim).count();
        let batch = coalesce(&TranscriptInterimReplacement, chunks);
        let items: Vec<_> = batch.groups.iter().flat_map(|g| g.items.iter()).collect();

        prop_assert_eq!(items.iter().filter(|c| !c.interim).count(), finals);
        for interim in items.iter().filter(|c| c.interim) {
            let superseded = items.iter().any(|f| {
                !f.interim && f.speaker_id == interim.speaker_id && f.overlaps(interim)
            });
            prop_assert!(!superseded);
        }
        prop_assert!(items.windows(2).all(|w| (w[0].start_ms, w[0].end_ms) <= (w[1].start_ms, w[1].end_ms)));
    }

    #[test]
    fn note_operations_are_never_dropped_and_come_out_sorted(
        sequences in prop::collection::hash_set(1u64..500, 0..40),
    ) {
        let ops: Vec<_> = sequences
            .iter()
            .enumerate()
            .map(|(i, &seq)| {
                let meeting = if i % 2 == 0 { "m1" } else { "m2" };
                note_op(meeting, "u1", insert(0, "x"), seq, 0)
            })
            .collect();

        let batch = coalesce(&NoteSequenceOrdered, ops);
        prop_assert_eq!(batch.output_len(), sequences.len());
        for group in &batch.groups {
            prop_assert!(group.items.windows(2).all(|w| w[0].server_sequence < w[1].server_sequence));
            prop_assert!(group.items.iter().all(|op| op.meeting_id.as_str() == group.key));
        }
    }
}
