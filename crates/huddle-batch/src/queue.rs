//! FIFO queue with size- and age-based flush triggers.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

fn default_max_batch_size() -> usize {
    50
}

fn default_max_wait_ms() -> u64 {
    1_000
}

/// Flush thresholds for one processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Queue depth that triggers an immediate flush.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Longest an item may wait before a flush, in milliseconds.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

impl BatchConfig {
    /// Creates a config with explicit thresholds.
    #[must_use]
    pub const fn new(max_batch_size: usize, max_wait_ms: u64) -> Self {
        Self {
            max_batch_size,
            max_wait_ms,
        }
    }

    /// Returns the maximum wait as a duration.
    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Why a flush happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    /// Queue depth reached `max_batch_size`.
    Size,
    /// The oldest item waited `max_wait`.
    Age,
    /// A caller forced the flush.
    Manual,
    /// Final flush during shutdown.
    Shutdown,
}

impl FlushTrigger {
    /// Returns the trigger as a metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Age => "age",
            Self::Manual => "manual",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payload with its enqueue time.
#[derive(Debug, Clone)]
pub struct QueuedItem<T> {
    /// The payload.
    pub item: T,
    /// When the payload was enqueued.
    pub enqueued_at: Instant,
}

/// Unbounded FIFO of pending items.
///
/// The queue does not enforce its thresholds; it reports when a flush is due
/// and the owner decides when to drain.
#[derive(Debug)]
pub struct BatchQueue<T> {
    items: VecDeque<QueuedItem<T>>,
}

impl<T> Default for BatchQueue<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<T> BatchQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an item and returns the new depth.
    pub fn push(&mut self, item: T, now: Instant) -> usize {
        self.items.push_back(QueuedItem {
            item,
            enqueued_at: now,
        });
        self.items.len()
    }

    /// Returns the number of pending items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the enqueue time of the oldest pending item.
    #[must_use]
    pub fn oldest_enqueued_at(&self) -> Option<Instant> {
        self.items.front().map(|q| q.enqueued_at)
    }

    /// Returns the instant at which the next flush is due, if anything is pending.
    #[must_use]
    pub fn next_deadline(&self, config: &BatchConfig) -> Option<Instant> {
        if self.items.len() >= config.max_batch_size.max(1) {
            return self.oldest_enqueued_at().map(|_| Instant::now());
        }
        self.oldest_enqueued_at().map(|at| at + config.max_wait())
    }

    /// Returns the trigger for a flush that is due at `now`, if any.
    #[must_use]
    pub fn flush_due(&self, config: &BatchConfig, now: Instant) -> Option<FlushTrigger> {
        if self.items.is_empty() {
            None
        } else if self.items.len() >= config.max_batch_size.max(1) {
            Some(FlushTrigger::Size)
        } else {
            self.oldest_enqueued_at()
                .filter(|at| now.saturating_duration_since(*at) >= config.max_wait())
                .map(|_| FlushTrigger::Age)
        }
    }

    /// Removes and returns every pending item in FIFO order.
    pub fn drain(&mut self) -> Vec<QueuedItem<T>> {
        self.items.drain(..).collect()
    }
}
