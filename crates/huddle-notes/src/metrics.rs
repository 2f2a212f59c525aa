//! Note merge metrics.

use metrics::{counter, describe_counter};

/// Merged operations counter, labelled by outcome.
pub const NOTE_OPERATIONS: &str = "huddle_note_operations_total";

/// Document and sequence CAS retries.
pub const NOTE_CAS_RETRY: &str = "huddle_note_cas_retry_total";

/// Registers all note metric descriptions.
pub fn register_metrics() {
    describe_counter!(NOTE_OPERATIONS, "Note operations merged, by outcome");
    describe_counter!(NOTE_CAS_RETRY, "Note document and sequence CAS retries");
}

/// Records the outcome counts of one merged batch.
pub fn record_merge(applied: usize, conflicts: usize, rejected: usize) {
    for (outcome, count) in [
        ("applied", applied),
        ("conflict", conflicts),
        ("rejected", rejected),
    ] {
        if count > 0 {
            counter!(NOTE_OPERATIONS, "outcome" => outcome).increment(count as u64);
        }
    }
}

/// Records a lost compare-and-swap race on `target` (`document` or `sequence`).
pub fn record_cas_retry(target: &'static str) {
    counter!(NOTE_CAS_RETRY, "target" => target).increment(1);
}
