//! Property-based tests for note merge invariants.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use proptest::prelude::*;
use tokio_test::block_on;

use huddle_core::MemoryBackend;
use huddle_core::events::{NoteOperation, NoteOperationEnvelope};
use huddle_notes::{MergeEngine, NoteDocument, NoteStore, OperationStatus};
use huddle_test_utils::fixtures::{meeting, note_op};

/// Generates an arbitrary operation; positions may fall outside the document.
fn arb_operation() -> impl Strategy<Value = NoteOperation> {
    prop_oneof![
        (0usize..40, "[a-zé ]{1,5}")
            .prop_map(|(position, text)| NoteOperation::Insert { position, text }),
        (0usize..40, 1usize..6)
            .prop_map(|(position, length)| NoteOperation::Delete { position, length }),
        (0usize..40).prop_map(|length| NoteOperation::Retain { length }),
    ]
}

/// Generates a batch with unique, shuffled server sequences and
/// expected versions near the true version.
fn arb_batch() -> impl Strategy<Value = Vec<NoteOperationEnvelope>> {
    prop::collection::vec((arb_operation(), 0u64..12), 0..20)
        .prop_map(|ops| {
            ops.into_iter()
                .enumerate()
                .map(|(i, (op, expected))| note_op("m1", "u1", op, i as u64 + 1, expected))
                .collect::<Vec<_>>()
        })
        .prop_shuffle()
}

proptest! {
    #[test]
    fn every_operation_is_accounted_for(
        initial in "[a-z]{0,20}",
        batch in arb_batch(),
    ) {
        let total = batch.len();
        let outcome = MergeEngine::default().apply_batch(NoteDocument::new(initial), batch);
        prop_assert_eq!(
            outcome.applied.len() + outcome.conflicts.len() + outcome.rejected.len(),
            total
        );
    }

    #[test]
    fn version_advances_once_per_applied_operation(
        initial in "[a-z]{0,20}",
        batch in arb_batch(),
    ) {
        let outcome = MergeEngine::default().apply_batch(NoteDocument::new(initial), batch);
        prop_assert_eq!(outcome.document.version, outcome.applied.len() as u64);

        for (i, applied) in outcome.applied.iter().enumerate() {
            prop_assert_eq!(applied.resulting_version, i as u64 + 1);
            prop_assert_eq!(applied.operation.expected_version, i as u64);
        }
    }

    #[test]
    fn applied_operations_follow_server_sequence(batch in arb_batch()) {
        let outcome = MergeEngine::default().apply_batch(NoteDocument::new("seed text"), batch);
        let sequences: Vec<_> = outcome
            .applied
            .iter()
            .map(|a| a.operation.server_sequence)
            .collect();
        prop_assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn content_length_matches_applied_edits(
        initial in "[a-z]{0,20}",
        batch in arb_batch(),
    ) {
        let start_len = initial.chars().count() as i64;
        let outcome = MergeEngine::default().apply_batch(NoteDocument::new(initial), batch);

        let delta: i64 = outcome
            .applied
            .iter()
            .map(|a| match &a.operation.operation {
                NoteOperation::Insert { text, .. } => text.chars().count() as i64,
                NoteOperation::Delete { length, .. } => -(*length as i64),
                NoteOperation::Retain { .. } => 0,
            })
            .sum();
        prop_assert_eq!(outcome.document.char_len() as i64, start_len + delta);
    }

    #[test]
    fn store_logs_every_operation(batch in arb_batch()) {
        let store = NoteStore::new(Arc::new(MemoryBackend::new()));
        let m = meeting("m1");
        let sequences: Vec<_> = batch.iter().map(|op| op.server_sequence).collect();

        let outcome = block_on(store.apply_batch(&m, batch)).expect("apply");

        for seq in sequences {
            let entry = block_on(store.operation(&m, seq)).expect("read").expect("logged");
            let applied = outcome.applied.iter().any(|a| a.operation.server_sequence == seq);
            prop_assert_eq!(entry.status == OperationStatus::Applied, applied);
        }
        let stored = block_on(store.load(&m)).expect("load");
        prop_assert_eq!(stored.document.version, outcome.applied.len() as u64);
    }
}
