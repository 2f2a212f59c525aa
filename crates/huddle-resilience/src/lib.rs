//! # huddle-resilience
//!
//! Failure-handling primitives for calls to unreliable external services
//! (video rooms, embeddings):
//!
//! - [`RetryPolicy`]: exponential backoff with up to 10% jitter
//! - [`with_timeout`]: deadline wrapper
//! - [`CircuitBreaker`]: closed/open/half-open state machine per dependency
//! - [`Bulkhead`]: bounded concurrency with a FIFO wait queue
//! - [`DeadLetterQueue`]: in-memory holding area for exhausted operations
//! - [`GuardedExecutor`]: all of the above composed for one dependency
//! - [`ResilienceRegistry`]: explicit owner of named breakers and bulkheads
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use huddle_resilience::{ResilienceRegistry, RetryPolicy};
//!
//! # async fn demo() -> huddle_core::Result<()> {
//! let registry = ResilienceRegistry::default();
//! let video = registry.executor("video", RetryPolicy::default(), Some(Duration::from_secs(5)))?;
//! let room: String = video
//!     .execute("create_room", serde_json::json!({"meetingId": "mtg_1"}), || async {
//!         Ok("room_1".to_string())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod bulkhead;
pub mod circuit_breaker;
pub mod dead_letter;
pub mod executor;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod timeout;

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadStats};
pub use circuit_breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use dead_letter::{DeadLetterEntry, DeadLetterQueue};
pub use executor::GuardedExecutor;
pub use registry::ResilienceRegistry;
pub use retry::RetryPolicy;
pub use timeout::{with_optional_timeout, with_timeout};
