//! # huddle-core
//!
//! Shared primitives for the Huddle meeting control plane.
//!
//! - **Errors**: the control-plane error taxonomy and stable error codes
//! - **Identifiers**: validated meeting/user IDs and generated entry IDs
//! - **Storage**: the keyed durable store contract and an in-memory backend
//! - **Events**: transcript, presence and note-operation payloads
//! - **Clock**: injectable wall-clock time
//! - **Observability**: logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use huddle_core::prelude::*;
//!
//! let meeting = MeetingId::new("mtg_42").unwrap();
//! let err = Error::precondition(format!("meeting {meeting} is not active"));
//! assert_eq!(err.code(), ErrorCode::PreconditionFailed);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod error;
pub mod events;
pub mod id;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::error::{Error, ErrorCode, Result};
    pub use crate::events::{
        NoteOperation, NoteOperationEnvelope, PresenceStatus, PresenceUpdate, TranscriptChunk,
    };
    pub use crate::id::{DeadLetterId, MeetingId, UserId};
    pub use crate::storage::{MemoryBackend, StorageBackend, WritePrecondition, WriteResult};
}

pub use clock::{Clock, ManualClock, SystemClock, system_clock};
pub use error::{Error, ErrorCode, Result};
pub use id::{DeadLetterId, MeetingId, UserId};
pub use observability::{LogFormat, dependency_span, init_logging, meeting_span};
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
