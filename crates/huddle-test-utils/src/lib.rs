//! Shared test utilities for Huddle crates.
//!
//! This crate provides:
//! - [`TracingMemoryBackend`]: in-memory storage with operation recording
//!   and injected failures
//! - [`FlakyDependency`]: a fake external service that fails on demand
//! - Fixture builders for meeting events
//!
//! # Example
//!
//! ```rust,ignore
//! use huddle_test_utils::{TracingMemoryBackend, fixtures};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let storage = TracingMemoryBackend::new();
//!     let update = fixtures::joined("mtg_1", "user_1", 0);
//!     // ... run test ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod flaky;
pub mod storage;

pub use flaky::FlakyDependency;
pub use storage::{StorageOp, TracingMemoryBackend};

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("huddle=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
