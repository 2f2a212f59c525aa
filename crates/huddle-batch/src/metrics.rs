//! Batch processor metrics.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `huddle_batch_enqueued_total` | Counter | `processor`, `accepted` | Items offered to `add` |
//! | `huddle_batch_queue_depth` | Gauge | `processor` | Items waiting for a flush |
//! | `huddle_batch_flushes_total` | Counter | `processor`, `trigger` | Flushes that drained items |
//! | `huddle_batch_flush_duration_seconds` | Histogram | `processor` | Time spent in one flush |
//! | `huddle_batch_coalesced_total` | Counter | `processor` | Items removed by coalescing |
//! | `huddle_batch_write_failures_total` | Counter | `processor` | Groups whose writer failed |

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: items offered to a processor.
    pub const ENQUEUED_TOTAL: &str = "huddle_batch_enqueued_total";
    /// Gauge: items waiting for a flush.
    pub const QUEUE_DEPTH: &str = "huddle_batch_queue_depth";
    /// Counter: non-empty flushes.
    pub const FLUSHES_TOTAL: &str = "huddle_batch_flushes_total";
    /// Histogram: flush duration in seconds.
    pub const FLUSH_DURATION_SECONDS: &str = "huddle_batch_flush_duration_seconds";
    /// Counter: items removed by coalescing.
    pub const COALESCED_TOTAL: &str = "huddle_batch_coalesced_total";
    /// Counter: groups whose writer call failed.
    pub const WRITE_FAILURES_TOTAL: &str = "huddle_batch_write_failures_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Processor name (transcripts, note_ops, presence).
    pub const PROCESSOR: &str = "processor";
    /// Flush trigger (size, age, manual, shutdown).
    pub const TRIGGER: &str = "trigger";
    /// Whether `add` accepted the item.
    pub const ACCEPTED: &str = "accepted";
}

/// Metrics recorder bound to one processor. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BatchMetrics {
    processor: String,
}

impl BatchMetrics {
    /// Creates a recorder for `processor`.
    #[must_use]
    pub fn new(processor: impl Into<String>) -> Self {
        Self {
            processor: processor.into(),
        }
    }

    /// Records an `add` call.
    pub fn record_enqueue(&self, accepted: bool) {
        counter!(
            names::ENQUEUED_TOTAL,
            labels::PROCESSOR => self.processor.clone(),
            labels::ACCEPTED => if accepted { "true" } else { "false" },
        )
        .increment(1);
    }

    /// Sets the pending depth gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_queue_depth(&self, depth: usize) {
        gauge!(names::QUEUE_DEPTH, labels::PROCESSOR => self.processor.clone()).set(depth as f64);
    }

    /// Records a completed flush.
    pub fn record_flush(&self, trigger: &'static str, duration: Duration, input: usize, output: usize) {
        counter!(
            names::FLUSHES_TOTAL,
            labels::PROCESSOR => self.processor.clone(),
            labels::TRIGGER => trigger,
        )
        .increment(1);
        histogram!(
            names::FLUSH_DURATION_SECONDS,
            labels::PROCESSOR => self.processor.clone(),
        )
        .record(duration.as_secs_f64());
        counter!(names::COALESCED_TOTAL, labels::PROCESSOR => self.processor.clone())
            .increment(input.saturating_sub(output) as u64);
    }

    /// Records a failed group write.
    pub fn record_write_failure(&self) {
        counter!(names::WRITE_FAILURES_TOTAL, labels::PROCESSOR => self.processor.clone())
            .increment(1);
    }
}
