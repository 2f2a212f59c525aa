//! Client-facing operation metrics.

use metrics::{counter, describe_counter};

use huddle_core::ErrorCode;

/// Client events offered to a queue, labelled by kind and outcome.
pub const EVENTS_OFFERED: &str = "huddle_api_events_offered_total";

/// Events persisted by the flush writers, labelled by kind.
pub const EVENTS_PERSISTED: &str = "huddle_api_events_persisted_total";

/// Presence updates older than the stored state.
pub const STALE_PRESENCE: &str = "huddle_api_stale_presence_total";

/// Registers every metric description in the workspace.
///
/// Call this once at application startup after installing a recorder.
pub fn register_metrics() {
    huddle_resilience::metrics::register_metrics();
    huddle_ledger::metrics::register_metrics();
    huddle_notes::metrics::register_metrics();

    describe_counter!(EVENTS_OFFERED, "Client events offered to a queue, by outcome");
    describe_counter!(EVENTS_PERSISTED, "Events persisted by flush writers");
    describe_counter!(STALE_PRESENCE, "Presence updates older than stored state");
}

/// Records a queued (or refused after shutdown) event.
pub fn record_offered(kind: &'static str, accepted: bool) {
    let outcome = if accepted { "queued" } else { "closed" };
    counter!(EVENTS_OFFERED, "kind" => kind, "outcome" => outcome).increment(1);
}

/// Records an event rejected before reaching a queue.
pub fn record_rejected(kind: &'static str, code: ErrorCode) {
    counter!(EVENTS_OFFERED, "kind" => kind, "outcome" => code.as_str()).increment(1);
}

/// Records `count` persisted events.
pub fn record_persisted(kind: &'static str, count: usize) {
    counter!(EVENTS_PERSISTED, "kind" => kind).increment(count as u64);
}

/// Records a presence update dropped as stale.
pub fn record_stale_presence() {
    counter!(STALE_PRESENCE).increment(1);
}
