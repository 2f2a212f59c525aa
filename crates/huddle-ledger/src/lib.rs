//! # huddle-ledger
//!
//! Durable, store-backed guards for write handlers:
//!
//! - [`IdempotencyLedger`]: `(key, scope)`-addressed records that make
//!   handlers safe to retry, with inline or blob-referenced results
//! - [`RateLimiter`]: fixed-window per-subject counters updated by
//!   compare-and-swap
//!
//! Both keep all state in a [`huddle_core::StorageBackend`], so any number of
//! instances can share them.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use huddle_core::MemoryBackend;
//! use huddle_ledger::IdempotencyLedger;
//!
//! # async fn demo() -> huddle_core::Result<()> {
//! let ledger = IdempotencyLedger::new(Arc::new(MemoryBackend::new()));
//! let meeting: String = ledger
//!     .execute("create-meeting-abc123", "meetings", None, || async {
//!         Ok("meeting_xyz789".to_string())
//!     })
//!     .await?;
//! assert_eq!(meeting, "meeting_xyz789");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod idempotency;
pub mod metrics;
pub mod rate_limit;

pub use idempotency::{
    IdempotencyConfig, IdempotencyLedger, IdempotencyRecord, ResolvedResult, ResultKind,
    ResultMetadata,
};
pub use rate_limit::{RateLimitDecision, RateLimitRule, RateLimiter, RateWindow};
