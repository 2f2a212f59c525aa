//! Ledger metrics.
//!
//! Outcome counters for idempotent executions and rate-limit checks, plus
//! compare-and-swap retries on window counters.

use metrics::{counter, describe_counter};

/// Idempotency claim outcomes counter.
pub const IDEMPOTENCY_CHECKS: &str = "huddle_idempotency_checks_total";

/// Stale in-progress record takeovers counter.
pub const IDEMPOTENCY_TAKEOVERS: &str = "huddle_idempotency_takeovers_total";

/// Results written to the blob store counter.
pub const IDEMPOTENCY_BLOB_WRITES: &str = "huddle_idempotency_blob_writes_total";

/// Rate-limit decisions counter.
pub const RATE_LIMIT_DECISIONS: &str = "huddle_rate_limit_decisions_total";

/// Window counter CAS retries.
pub const RATE_LIMIT_CAS_RETRY: &str = "huddle_rate_limit_cas_retry_total";

/// Registers all ledger metric descriptions.
///
/// Call this once at application startup after installing a recorder.
pub fn register_metrics() {
    describe_counter!(IDEMPOTENCY_CHECKS, "Idempotency claim outcomes by scope");
    describe_counter!(IDEMPOTENCY_TAKEOVERS, "Stale in-progress idempotency records taken over");
    describe_counter!(IDEMPOTENCY_BLOB_WRITES, "Idempotent results stored out of line");
    describe_counter!(RATE_LIMIT_DECISIONS, "Rate-limit decisions by action and outcome");
    describe_counter!(RATE_LIMIT_CAS_RETRY, "Rate-limit window counter CAS retries");
}

/// Records the outcome of an idempotency claim (`proceed`, `replay`, `conflict`, `in_progress`).
pub fn record_idempotency_check(scope: &str, outcome: &'static str) {
    counter!(
        IDEMPOTENCY_CHECKS,
        "scope" => scope.to_string(),
        "outcome" => outcome,
    )
    .increment(1);
}

/// Records a takeover attempt (`success` or `race_detected`).
pub fn record_idempotency_takeover(scope: &str, result: &'static str) {
    counter!(
        IDEMPOTENCY_TAKEOVERS,
        "scope" => scope.to_string(),
        "result" => result,
    )
    .increment(1);
}

/// Records a result written to the blob store.
pub fn record_blob_write(scope: &str) {
    counter!(IDEMPOTENCY_BLOB_WRITES, "scope" => scope.to_string()).increment(1);
}

/// Records a rate-limit decision.
pub fn record_rate_limit(action: &str, allowed: bool) {
    counter!(
        RATE_LIMIT_DECISIONS,
        "action" => action.to_string(),
        "outcome" => if allowed { "allowed" } else { "rejected" },
    )
    .increment(1);
}

/// Records a lost compare-and-swap race on a window counter.
pub fn record_cas_retry(action: &str) {
    counter!(RATE_LIMIT_CAS_RETRY, "action" => action.to_string()).increment(1);
}
