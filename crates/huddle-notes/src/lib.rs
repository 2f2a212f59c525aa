//! # huddle-notes
//!
//! Collaborative meeting notes under version-gated optimistic concurrency.
//!
//! Clients submit insert/delete/retain edits tagged with the document version
//! they were based on. The server stamps each edit with a per-meeting
//! sequence number ([`SequenceAllocator`]), queues it, and on flush the
//! [`NoteBatchWriter`] hands the meeting's edits to the [`NoteStore`], which
//! merges them with the [`MergeEngine`] and persists the document plus an
//! operation log.
//!
//! This is a simplified transform: a stale edit is reported as a conflict
//! for the client to rebase, never rewritten by the server.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod document;
pub mod merge;
pub mod metrics;
pub mod sequence;
pub mod store;
pub mod writer;

pub use document::NoteDocument;
pub use merge::{AppliedOperation, MergeEngine, MergeOutcome, RejectedOperation, VersionConflict};
pub use sequence::SequenceAllocator;
pub use store::{NoteStore, OperationLogEntry, OperationStatus, StoredDocument};
pub use writer::NoteBatchWriter;
