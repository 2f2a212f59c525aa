//! External providers reached only through guarded executors.
//!
//! Video room creation is additionally deduplicated through the idempotency
//! ledger, so a client retrying with the same key gets the same room.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use huddle_core::MeetingId;
use huddle_core::error::{Error, Result};
use huddle_ledger::IdempotencyLedger;
use huddle_ledger::idempotency::hash_key;
use huddle_resilience::{GuardedExecutor, ResilienceRegistry};

use crate::config::ResilienceSettings;

/// Dependency name of the video provider.
pub const VIDEO_DEPENDENCY: &str = "video";

/// Dependency name of the embedding provider.
pub const EMBEDDING_DEPENDENCY: &str = "embeddings";

/// Ledger scope for room creation.
pub const ROOM_SCOPE: &str = "video_rooms";

/// Parameters of a new video room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRequest {
    /// Meeting the room serves.
    pub meeting_id: MeetingId,
    /// Participant cap, when the provider supports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_participants: Option<u32>,
}

/// A provisioned video room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRoom {
    /// Provider-side room identifier.
    pub room_id: String,
    /// URL participants join through.
    pub join_url: String,
}

/// Video conferencing provider.
#[async_trait]
pub trait VideoProvider: Send + Sync + 'static {
    /// Provisions a room.
    async fn create_room(&self, request: &RoomRequest) -> Result<VideoRoom>;

    /// Tears a room down.
    async fn delete_room(&self, room_id: &str) -> Result<()>;
}

/// Vector embedding provider.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync + 'static {
    /// Creates or replaces the embedding of `document_id`.
    async fn upsert(&self, document_id: &str, text: &str) -> Result<()>;

    /// Removes the embedding of `document_id`.
    async fn remove(&self, document_id: &str) -> Result<()>;
}

/// Embedding work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EmbeddingOperation {
    /// Embed `text` under `document_id`.
    Create {
        /// Document identifier.
        document_id: String,
        /// Text to embed.
        text: String,
    },
    /// Drop the embedding of `document_id`.
    Delete {
        /// Document identifier.
        document_id: String,
    },
}

impl EmbeddingOperation {
    /// Returns the operation kind as a string.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create_embedding",
            Self::Delete { .. } => "delete_embedding",
        }
    }
}

/// Guarded access to the configured providers.
pub struct ExternalServices {
    video: Option<Arc<dyn VideoProvider>>,
    embeddings: Option<Arc<dyn EmbeddingProvider>>,
    video_executor: GuardedExecutor,
    embedding_executor: GuardedExecutor,
    ledger: IdempotencyLedger,
}

impl std::fmt::Debug for ExternalServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalServices")
            .field("video", &self.video.is_some())
            .field("embeddings", &self.embeddings.is_some())
            .field("video_executor", &self.video_executor)
            .field("embedding_executor", &self.embedding_executor)
            .finish_non_exhaustive()
    }
}

impl ExternalServices {
    /// Creates services with executors taken from `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn new(
        registry: &ResilienceRegistry,
        settings: &ResilienceSettings,
        ledger: IdempotencyLedger,
    ) -> Result<Self> {
        let timeout = Some(settings.external_timeout());
        Ok(Self {
            video: None,
            embeddings: None,
            video_executor: registry.executor(VIDEO_DEPENDENCY, settings.retry.clone(), timeout)?,
            embedding_executor: registry.executor(
                EMBEDDING_DEPENDENCY,
                settings.retry.clone(),
                timeout,
            )?,
            ledger,
        })
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

    fn video(&self) -> Result<&Arc<dyn VideoProvider>> {
        self.video
            .as_ref()
            .ok_or_else(|| Error::internal("no video provider configured"))
    }

    fn embeddings(&self) -> Result<&Arc<dyn EmbeddingProvider>> {
        self.embeddings
            .as_ref()
            .ok_or_else(|| Error::internal("no embedding provider configured"))
    }

    /// Creates a room at most once per `idempotency_key`.
    ///
    /// A retry with the same key and request returns the stored room.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PreconditionFailed`] when the key was used for a
    /// different request or the first call is still running, or the final
    /// provider error after retries.
    #[tracing::instrument(skip(self, request), fields(meeting_id = %request.meeting_id))]
    pub async fn create_room(
        &self,
        idempotency_key: &str,
        request: RoomRequest,
    ) -> Result<VideoRoom> {
        let video = self.video()?;
        let payload = serde_json::to_value(&request)?;
        let fingerprint = hash_key(&payload.to_string());

        self.ledger
            .execute(idempotency_key, ROOM_SCOPE, Some(&fingerprint), || {
                self.video_executor
                    .execute("create_room", payload, || video.create_room(&request))
            })
            .await
    }

    /// Tears a room down.
    ///
    /// # Errors
    ///
    /// Returns the final provider error after retries.
    pub async fn delete_room(&self, room_id: &str) -> Result<()> {
        let video = self.video()?;
        self.video_executor
            .execute(
                "delete_room",
                serde_json::json!({ "roomId": room_id }),
                || video.delete_room(room_id),
            )
            .await
    }

    /// Runs one embedding operation.
    ///
    /// # Errors
    ///
    /// Returns the final provider error after retries.
    pub async fn apply_embedding(&self, operation: EmbeddingOperation) -> Result<()> {
        let embeddings = self.embeddings()?;
        let payload = serde_json::to_value(&operation)?;
        self.embedding_executor
            .execute(operation.kind(), payload, || match &operation {
                EmbeddingOperation::Create { document_id, text } => {
                    embeddings.upsert(document_id, text)
                }
                EmbeddingOperation::Delete { document_id } => embeddings.remove(document_id),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::{ErrorCode, MemoryBackend};
    use huddle_resilience::{BreakerConfig, BulkheadConfig, DeadLetterQueue, RetryPolicy};
    use huddle_test_utils::FlakyDependency;
    use huddle_test_utils::fixtures::meeting;
    use std::sync::Mutex;

    struct FakeVideo {
        dependency: FlakyDependency,
    }

    #[async_trait]
    impl VideoProvider for FakeVideo {
        async fn create_room(&self, request: &RoomRequest) -> Result<VideoRoom> {
            let n = self.dependency.calls() + 1;
            self.dependency
                .call(VideoRoom {
                    room_id: format!("room_{n}"),
                    join_url: format!("https://video.test/{}", request.meeting_id),
                })
                .await
        }

        async fn delete_room(&self, _room_id: &str) -> Result<()> {
            self.dependency.call(()).await
        }
    }

    #[derive(Default)]
    struct RecordingEmbeddings {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EmbeddingProvider for RecordingEmbeddings {
        async fn upsert(&self, document_id: &str, _text: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("upsert:{document_id}"));
            Ok(())
        }

        async fn remove(&self, document_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("remove:{document_id}"));
            Ok(())
        }
    }

    fn settings() -> ResilienceSettings {
        ResilienceSettings {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 10,
                max_delay_ms: 50,
                backoff_multiplier: 2.0,
            },
            ..ResilienceSettings::default()
        }
    }

    fn services(dependency: FlakyDependency) -> (ExternalServices, Arc<ResilienceRegistry>) {
        let registry = Arc::new(ResilienceRegistry::new(
            BreakerConfig::default(),
            BulkheadConfig::default(),
            Arc::new(DeadLetterQueue::new(huddle_core::system_clock())),
        ));
        let ledger = IdempotencyLedger::new(Arc::new(MemoryBackend::new()));
        let services = ExternalServices::new(&registry, &settings(), ledger)
            .unwrap()
            .with_video(Arc::new(FakeVideo { dependency }));
        (services, registry)
    }

    fn request() -> RoomRequest {
        RoomRequest {
            meeting_id: meeting("mtg_1"),
            max_participants: Some(8),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn room_creation_retries_then_replays() -> Result<()> {
        let dependency = FlakyDependency::new(VIDEO_DEPENDENCY, 2);
        let (services, _registry) = services(dependency.clone());

        let first = services.create_room("room-key-1", request()).await?;
        assert_eq!(first.room_id, "room_3");
        assert_eq!(dependency.calls(), 3);

        let replay = services.create_room("room-key-1", request()).await?;
        assert_eq!(replay, first);
        assert_eq!(dependency.calls(), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn reused_key_with_different_request_is_rejected() -> Result<()> {
        let (services, _registry) = services(FlakyDependency::new(VIDEO_DEPENDENCY, 0));
        services.create_room("room-key-1", request()).await?;

        let other = RoomRequest {
            meeting_id: meeting("mtg_2"),
            max_participants: None,
        };
        let err = services.create_room("room-key-1", other).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PreconditionFailed);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_creation_keeps_key_reserved() {
        let dependency = FlakyDependency::always_failing(VIDEO_DEPENDENCY);
        let (services, registry) = services(dependency.clone());

        let err = services.create_room("room-key-1", request()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExternalServiceError);
        assert_eq!(dependency.calls(), 3);
        assert_eq!(registry.dead_letters().len().unwrap(), 1);

        // The provider may have created the room, so the same key must not
        // reach it again.
        let err = services.create_room("room-key-1", request()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PreconditionFailed);
        assert_eq!(dependency.calls(), 3);

        // A new key reaches the provider until the breaker opens at five
        // consecutive failures.
        let err = services.create_room("room-key-2", request()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::CircuitOpen);
        assert_eq!(dependency.calls(), 5);
    }

    #[tokio::test]
    async fn embedding_operations_dispatch_by_kind() -> Result<()> {
        let (services, _registry) = services(FlakyDependency::new(VIDEO_DEPENDENCY, 0));
        let embeddings = Arc::new(RecordingEmbeddings::default());
        let services = services.with_embeddings(embeddings.clone());

        services
            .apply_embedding(EmbeddingOperation::Create {
                document_id: "doc_1".into(),
                text: "notes".into(),
            })
            .await?;
        services
            .apply_embedding(EmbeddingOperation::Delete {
                document_id: "doc_1".into(),
            })
            .await?;

        assert_eq!(
            *embeddings.calls.lock().unwrap(),
            vec!["upsert:doc_1", "remove:doc_1"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_provider_is_internal_error() {
        let (services, _registry) = services(FlakyDependency::new(VIDEO_DEPENDENCY, 0));
        let err = services
            .apply_embedding(EmbeddingOperation::Delete {
                document_id: "doc_1".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[test]
    fn embedding_operation_wire_format() -> Result<()> {
        let op = EmbeddingOperation::Delete {
            document_id: "doc_1".into(),
        };
        assert_eq!(
            serde_json::to_value(&op)?,
            serde_json::json!({"type": "delete", "document_id": "doc_1"})
        );
        Ok(())
    }
}
