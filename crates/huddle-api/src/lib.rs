//! # huddle-api
//!
//! Client-facing meeting operations for the Huddle control plane.
//!
//! [`AppContext`] wires the pieces together: event handlers that admit and
//! queue transcript fragments, note edits and presence changes; flush writers
//! that persist them per meeting; and guarded access to the video and
//! embedding providers.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use huddle_api::{AppContext, HuddleConfig, InMemorySessions, TranscriptChunkRequest};
//! use huddle_core::{MeetingId, MemoryBackend};
//!
//! # async fn demo() -> huddle_core::Result<()> {
//! let sessions = InMemorySessions::new();
//! let meeting = MeetingId::new("mtg_1")?;
//! sessions.start(meeting.clone())?;
//!
//! let ctx = AppContext::builder(
//!     HuddleConfig::default(),
//!     Arc::new(MemoryBackend::new()),
//!     Arc::new(sessions),
//! )
//! .build()?;
//!
//! let receipt = ctx
//!     .handlers()
//!     .queue_transcript_chunk(TranscriptChunkRequest {
//!         meeting_id: meeting,
//!         speaker_id: None,
//!         text: "Good morning".into(),
//!         confidence: 0.93,
//!         start_ms: 0,
//!         end_ms: 1_200,
//!         interim: false,
//!     })
//!     .await?;
//! assert!(receipt.queued);
//!
//! ctx.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod external;
pub mod handlers;
pub mod metrics;
pub mod sessions;
pub mod writers;

pub use config::{BatchSettings, HuddleConfig, RateLimitSettings, ResilienceSettings};
pub use context::{AppContext, AppContextBuilder};
pub use external::{
    EmbeddingOperation, EmbeddingProvider, ExternalServices, RoomRequest, VideoProvider, VideoRoom,
};
pub use handlers::{
    EventHandlers, FlushSummary, NoteOperationRequest, NoteQueueReceipt, PresenceRequest,
    ProcessorStats, QueueReceipt, QueueStats, TranscriptChunkRequest,
};
pub use sessions::{InMemorySessions, MeetingSessions};
pub use writers::{PresenceWriter, TranscriptWriter};
