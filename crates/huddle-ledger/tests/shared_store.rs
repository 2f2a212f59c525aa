//! Ledger and limiter instances sharing one durable store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use huddle_core::clock::ManualClock;
use huddle_core::{Error, ErrorCode, Result, StorageBackend};
use huddle_ledger::{IdempotencyLedger, RateLimiter, ResultKind};
use huddle_test_utils::{StorageOp, TracingMemoryBackend};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Room {
    room_id: String,
    join_url: String,
}

#[tokio::test]
async fn second_instance_replays_stored_result() -> Result<()> {
    let storage = TracingMemoryBackend::new();
    let shared: Arc<dyn StorageBackend> = Arc::new(storage.clone());
    let first = IdempotencyLedger::new(Arc::clone(&shared));
    let second = IdempotencyLedger::new(shared);
    let created = AtomicU32::new(0);

    let create = || async {
        let n = created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok::<_, Error>(Room {
            room_id: format!("room_{n}"),
            join_url: format!("https://video.example/room_{n}"),
        })
    };

    let (a, b) = futures::join!(
        first.execute("mtg_1", "video_rooms", Some("req-a"), create),
        second.execute("mtg_1", "video_rooms", Some("req-a"), create),
    );
    let (a, b) = (a?, b?);

    assert_eq!(a, b);
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(
        second.resolve("mtg_1", "video_rooms").await?.kind,
        ResultKind::Storage
    );

    let claims = storage
        .operations()
        .into_iter()
        .filter(|op| matches!(op, StorageOp::Put { path, applied: true, .. } if path.starts_with("idempotency/")))
        .count();
    // One claim plus one completion patch.
    assert_eq!(claims, 2);
    Ok(())
}

#[tokio::test]
async fn limiter_instances_share_windows() -> Result<()> {
    let storage: Arc<dyn StorageBackend> = Arc::new(TracingMemoryBackend::new());
    let clock = Arc::new(ManualClock::at_millis(0));
    let a = RateLimiter::new(Arc::clone(&storage)).with_clock(clock.clone());
    let b = RateLimiter::new(storage).with_clock(clock);

    a.enforce("user_1", "presence", 1_000, 2).await?;
    b.enforce("user_1", "presence", 1_000, 2).await?;
    let err = a
        .enforce("user_1", "presence", 1_000, 2)
        .await
        .expect_err("limit shared across instances");
    assert_eq!(err.code(), ErrorCode::RateLimitExceeded);
    Ok(())
}

#[tokio::test]
async fn ledger_storage_outage_surfaces_error() {
    let storage = TracingMemoryBackend::new();
    storage.inject_failure("idempotency/");
    let ledger = IdempotencyLedger::new(Arc::new(storage));

    let err = ledger
        .execute::<u32, _, _>("k", "s", None, || async { Ok(1) })
        .await
        .expect_err("store is down");
    assert_eq!(err.code(), ErrorCode::Storage);
}
