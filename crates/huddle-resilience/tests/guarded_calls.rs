//! Guarded calls against fake dependencies through a shared registry.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use huddle_core::{ErrorCode, Result};
use huddle_resilience::{
    BreakerConfig, BulkheadConfig, CircuitState, DeadLetterQueue, ResilienceRegistry, RetryPolicy,
};
use huddle_test_utils::FlakyDependency;

fn registry(failure_threshold: u32, max_concurrent: usize) -> ResilienceRegistry {
    ResilienceRegistry::new(
        BreakerConfig {
            failure_threshold,
            cooldown_ms: 30_000,
        },
        BulkheadConfig { max_concurrent },
        Arc::new(DeadLetterQueue::default()),
    )
}

fn attempts(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay_ms: 10,
        max_delay_ms: 100,
        backoff_multiplier: 2.0,
    }
}

#[tokio::test(start_paused = true)]
async fn breaker_is_shared_by_executors_of_one_dependency() -> Result<()> {
    let registry = registry(2, 10);
    let first = registry.executor("video", attempts(1), None)?;
    let second = registry.executor("video", attempts(1), None)?;
    let broken = FlakyDependency::always_failing("video");

    for _ in 0..2 {
        let err = first
            .execute("create_room", json!({}), || broken.call(()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExternalServiceError);
    }
    assert_eq!(registry.breaker("video")?.snapshot()?.state, CircuitState::Open);

    let healthy = FlakyDependency::new("video", 0);
    let err = second
        .execute("create_room", json!({}), || healthy.call(()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::CircuitOpen);
    assert_eq!(healthy.calls(), 0);

    tokio::time::sleep(Duration::from_millis(30_000)).await;
    second
        .execute("create_room", json!({}), || healthy.call(()))
        .await?;
    assert_eq!(healthy.calls(), 1);
    assert_eq!(registry.breaker("video")?.snapshot()?.state, CircuitState::Closed);

    let other = registry.executor("embeddings", attempts(1), None)?;
    other
        .execute("create_embedding", json!({}), || healthy.call(()))
        .await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn bulkhead_bounds_concurrent_calls() -> Result<()> {
    let registry = registry(5, 2);
    let executor = registry.executor("embeddings", attempts(1), None)?;
    let slow = &FlakyDependency::new("embeddings", 0).with_delay(Duration::from_millis(100));
    let in_flight = &AtomicUsize::new(0);
    let peak = &AtomicUsize::new(0);

    let started = Instant::now();
    let calls = (0..5).map(|i| {
        executor.execute("create_embedding", json!({ "doc": i }), move || async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            let result = slow.call(i).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        })
    });
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() >= Duration::from_millis(300));
    let stats = registry.bulkhead_stats()?;
    assert_eq!(stats["embeddings"].active, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn slow_dependency_times_out_and_is_dead_lettered() -> Result<()> {
    let registry = registry(5, 10);
    let executor = registry.executor("video", attempts(2), Some(Duration::from_millis(50)))?;
    let slow = FlakyDependency::new("video", 0).with_delay(Duration::from_millis(200));

    let err = executor
        .execute("create_room", json!({ "meetingId": "mtg_1" }), || slow.call(()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);
    assert_eq!(slow.calls(), 2);

    let parked = registry.dead_letters().get_all()?;
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].operation_name, "create_room");
    assert_eq!(parked[0].error_code, "TIMEOUT");
    assert_eq!(parked[0].attempts, 2);
    assert_eq!(parked[0].payload, json!({ "meetingId": "mtg_1" }));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn recovered_calls_leave_no_dead_letters() -> Result<()> {
    let registry = registry(5, 10);
    let executor = registry.executor("video", attempts(3), None)?;
    let flaky = FlakyDependency::new("video", 2);

    let room = executor
        .execute("create_room", json!({}), || flaky.call("room_1"))
        .await?;
    assert_eq!(room, "room_1");
    assert_eq!(flaky.calls(), 3);
    assert!(registry.dead_letters().is_empty()?);
    Ok(())
}
