//! Logging initialization and span constructors.
//!
//! All Huddle crates log through `tracing`. Binaries call [`init_logging`]
//! once; library code only creates spans and events.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name, falling back to pretty output.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops.
/// `RUST_LOG` controls levels (e.g. `info`, `huddle_batch=debug`).
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);

        // try_init: the host may already own the global subscriber.
        let _ = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        };
    });
}

/// Creates a span for work scoped to one meeting.
///
/// ```rust
/// use huddle_core::observability::meeting_span;
///
/// let span = meeting_span("flush_transcripts", "mtg_42");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn meeting_span(operation: &str, meeting_id: &str) -> Span {
    tracing::info_span!("meeting", op = operation, meeting_id = meeting_id)
}

/// Creates a span for a guarded call to an external dependency.
#[must_use]
pub fn dependency_span(operation: &str, dependency: &str) -> Span {
    tracing::info_span!("dependency", op = operation, dependency = dependency)
}
