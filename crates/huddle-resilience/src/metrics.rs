//! Resilience metrics.
//!
//! Counters and gauges for retries, timeouts, breaker transitions, bulkhead
//! occupancy and the dead-letter holding area.

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Retry attempts counter (attempts after the first).
pub const RETRY_ATTEMPTS: &str = "huddle_retry_attempts_total";

/// Timed-out operations counter.
pub const TIMEOUTS: &str = "huddle_timeouts_total";

/// Circuit breaker state transitions counter.
pub const CIRCUIT_TRANSITIONS: &str = "huddle_circuit_transitions_total";

/// Calls rejected by an open breaker counter.
pub const CIRCUIT_REJECTIONS: &str = "huddle_circuit_rejections_total";

/// In-flight operations per bulkhead gauge.
pub const BULKHEAD_ACTIVE: &str = "huddle_bulkhead_active";

/// Callers waiting for a bulkhead slot gauge.
pub const BULKHEAD_QUEUED: &str = "huddle_bulkhead_queued";

/// Dead-letter entries currently held gauge.
pub const DEAD_LETTERS: &str = "huddle_dead_letters";

/// Registers all resilience metric descriptions.
///
/// Call this once at application startup after installing a recorder.
pub fn register_metrics() {
    describe_counter!(RETRY_ATTEMPTS, "Retry attempts after a retryable failure");
    describe_counter!(TIMEOUTS, "Operations that exceeded their deadline");
    describe_counter!(CIRCUIT_TRANSITIONS, "Circuit breaker state transitions");
    describe_counter!(CIRCUIT_REJECTIONS, "Calls failed fast by an open breaker");
    describe_gauge!(BULKHEAD_ACTIVE, "Operations holding a bulkhead slot");
    describe_gauge!(BULKHEAD_QUEUED, "Callers waiting for a bulkhead slot");
    describe_gauge!(DEAD_LETTERS, "Entries in the dead-letter holding area");
}

/// Records a retry of `operation`.
pub fn record_retry(operation: &str) {
    counter!(RETRY_ATTEMPTS, "operation" => operation.to_string()).increment(1);
}

/// Records a timeout of `operation`.
pub fn record_timeout(operation: &str) {
    counter!(TIMEOUTS, "operation" => operation.to_string()).increment(1);
}

/// Records a breaker transition into `to_state`.
pub fn record_circuit_transition(dependency: &str, to_state: &'static str) {
    counter!(
        CIRCUIT_TRANSITIONS,
        "dependency" => dependency.to_string(),
        "to_state" => to_state,
    )
    .increment(1);
}

/// Records a call rejected by an open breaker.
pub fn record_circuit_rejection(dependency: &str) {
    counter!(CIRCUIT_REJECTIONS, "dependency" => dependency.to_string()).increment(1);
}

/// Publishes bulkhead occupancy.
#[allow(clippy::cast_precision_loss)]
pub fn set_bulkhead_occupancy(resource: &str, active: usize, queued: usize) {
    gauge!(BULKHEAD_ACTIVE, "resource" => resource.to_string()).set(active as f64);
    gauge!(BULKHEAD_QUEUED, "resource" => resource.to_string()).set(queued as f64);
}

/// Publishes the dead-letter backlog size.
#[allow(clippy::cast_precision_loss)]
pub fn set_dead_letters(count: usize) {
    gauge!(DEAD_LETTERS).set(count as f64);
}
