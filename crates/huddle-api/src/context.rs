//! Application context.
//!
//! One [`AppContext`] owns every process-local component: the three event
//! processors, the resilience registry and the stores built over the shared
//! durable backend. Nothing lives in a global; whoever serves requests holds
//! the context and calls [`AppContext::shutdown`] when draining.

use std::sync::Arc;

use huddle_core::error::Result;
use huddle_core::storage::StorageBackend;
use huddle_core::{Clock, system_clock};
use huddle_ledger::{IdempotencyLedger, RateLimiter};
use huddle_notes::{MergeEngine, NoteStore};
use huddle_resilience::{DeadLetterQueue, ResilienceRegistry};

use crate::config::HuddleConfig;
use crate::external::{EmbeddingProvider, ExternalServices, VideoProvider};
use crate::handlers::{EventHandlers, FlushSummary};
use crate::sessions::MeetingSessions;

/// Builder for [`AppContext`].
pub struct AppContextBuilder {
    config: HuddleConfig,
    storage: Arc<dyn StorageBackend>,
    blob_store: Option<Arc<dyn StorageBackend>>,
    sessions: Arc<dyn MeetingSessions>,
    clock: Arc<dyn Clock>,
    video: Option<Arc<dyn VideoProvider>>,
    embeddings: Option<Arc<dyn EmbeddingProvider>>,
}

impl AppContextBuilder {
    /// Stores large idempotent results outside the record store.
    #[must_use]
    pub fn with_blob_store(mut self, blob_store: Arc<dyn StorageBackend>) -> Self {
        self.blob_store = Some(blob_store);
        self
    }

    /// Overrides the wall clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Installs the video provider.
    #[must_use]
    pub fn with_video(mut self, provider: Arc<dyn VideoProvider>) -> Self {
        self.video = Some(provider);
        self
    }

    /// Installs the embedding provider.
    #[must_use]
    pub fn with_embeddings(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embeddings = Some(provider);
        self
    }

    /// Validates the configuration and starts the processors.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unusable configuration, or an
    /// error when called outside a tokio runtime.
    pub fn build(self) -> Result<AppContext> {
        let Self {
            config,
            storage,
            blob_store,
            sessions,
            clock,
            video,
            embeddings,
        } = self;
        config.validate()?;

        let registry = Arc::new(ResilienceRegistry::new(
            config.resilience.breaker.clone(),
            config.resilience.bulkhead.clone(),
            Arc::new(DeadLetterQueue::new(Arc::clone(&clock))),
        ));

        let mut ledger = IdempotencyLedger::new(Arc::clone(&storage))
            .with_clock(Arc::clone(&clock))
            .with_config(&config.idempotency);
        if let Some(blobs) = blob_store {
            ledger = ledger.with_blob_store(blobs);
        }

        let notes = NoteStore::new(Arc::clone(&storage))
            .with_engine(MergeEngine::default())
            .with_clock(Arc::clone(&clock));

        let handlers = EventHandlers::new(
            &config.batch,
            config.rate_limits.clone(),
            Arc::clone(&storage),
            notes.clone(),
            Arc::clone(&sessions),
            Arc::clone(&clock),
        )?;

        let mut external = ExternalServices::new(&registry, &config.resilience, ledger.clone())?;
        if let Some(video) = video {
            external = external.with_video(video);
        }
        if let Some(embeddings) = embeddings {
            external = external.with_embeddings(embeddings);
        }

        tracing::info!(
            transcripts = ?config.batch.transcripts,
            note_ops = ?config.batch.note_ops,
            presence = ?config.batch.presence,
            rate_limits = config.rate_limits.enabled,
            "application context ready"
        );

        Ok(AppContext {
            rate_limiter: RateLimiter::new(Arc::clone(&storage)).with_clock(Arc::clone(&clock)),
            config,
            storage,
            sessions,
            registry,
            ledger,
            notes,
            handlers,
            external,
        })
    }
}

/// Everything a request handler needs.
pub struct AppContext {
    config: HuddleConfig,
    storage: Arc<dyn StorageBackend>,
    sessions: Arc<dyn MeetingSessions>,
    registry: Arc<ResilienceRegistry>,
    ledger: IdempotencyLedger,
    rate_limiter: RateLimiter,
    notes: NoteStore,
    handlers: EventHandlers,
    external: ExternalServices,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .field("external", &self.external)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    /// Starts a builder over the durable store and session lookup.
    #[must_use]
    pub fn builder(
        config: HuddleConfig,
        storage: Arc<dyn StorageBackend>,
        sessions: Arc<dyn MeetingSessions>,
    ) -> AppContextBuilder {
        AppContextBuilder {
            config,
            storage,
            blob_store: None,
            sessions,
            clock: system_clock(),
            video: None,
            embeddings: None,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &HuddleConfig {
        &self.config
    }

    /// Returns the durable store.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Returns the session lookup.
    #[must_use]
    pub fn sessions(&self) -> &Arc<dyn MeetingSessions> {
        &self.sessions
    }

    /// Returns the breaker, bulkhead and dead-letter owner.
    #[must_use]
    pub fn resilience(&self) -> &Arc<ResilienceRegistry> {
        &self.registry
    }

    /// Returns the idempotency ledger.
    #[must_use]
    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    /// Returns the rate limiter for actions outside the event queues.
    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Returns the note store.
    #[must_use]
    pub fn notes(&self) -> &NoteStore {
        &self.notes
    }

    /// Returns the event operations.
    #[must_use]
    pub fn handlers(&self) -> &EventHandlers {
        &self.handlers
    }

    /// Returns the guarded external providers.
    #[must_use]
    pub fn external(&self) -> &ExternalServices {
        &self.external
    }

    /// Flushes and stops every processor.
    ///
    /// # Errors
    ///
    /// Returns an error if a processor lock is poisoned.
    pub async fn shutdown(&self) -> Result<FlushSummary> {
        tracing::info!("shutting down application context");
        self.handlers.shutdown().await
    }
}
