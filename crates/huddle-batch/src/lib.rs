//! # huddle-batch
//!
//! Absorbs high-frequency client events into bounded batches before they hit
//! durable storage.
//!
//! - [`BatchQueue`]: FIFO with size- and age-based flush triggers
//! - [`CoalescingBatchProcessor`]: queue + merge rule + per-aggregate writer
//! - [`strategies`]: presence last-write-wins, transcript interim
//!   replacement, and sequence-ordered note operations
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use huddle_batch::{BatchConfig, BatchWriter, CoalescingBatchProcessor};
//! use huddle_batch::strategies::PresenceLastWriteWins;
//! use huddle_core::events::PresenceUpdate;
//!
//! struct PresenceTable;
//!
//! #[async_trait]
//! impl BatchWriter<PresenceUpdate> for PresenceTable {
//!     async fn write_batch(&self, meeting: &str, items: &[PresenceUpdate]) -> huddle_core::Result<()> {
//!         println!("{meeting}: {} updates", items.len());
//!         Ok(())
//!     }
//! }
//!
//! # async fn demo() -> huddle_core::Result<()> {
//! let presence = CoalescingBatchProcessor::new(
//!     "presence",
//!     BatchConfig::new(50, 1_000),
//!     Arc::new(PresenceLastWriteWins),
//!     Arc::new(PresenceTable),
//! )?;
//! presence.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod coalesce;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod strategies;

pub use coalesce::{CoalescedBatch, CoalescingRule, Group, Merged, coalesce};
pub use processor::{
    AddOutcome, BatchErrorHandler, BatchWriter, CoalescingBatchProcessor, CollectingErrorHandler,
    FlushFailure, FlushReport, LogAndDrop, RecordedFailure,
};
pub use queue::{BatchConfig, BatchQueue, FlushTrigger, QueuedItem};
pub use strategies::{NoteSequenceOrdered, PresenceLastWriteWins, TranscriptInterimReplacement};
