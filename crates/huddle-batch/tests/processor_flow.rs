//! Processor behavior under concurrent producers and failing writers.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use huddle_batch::{
    BatchConfig, BatchWriter, CoalescingBatchProcessor, CollectingErrorHandler, FlushTrigger,
    NoteSequenceOrdered, PresenceLastWriteWins,
};
use huddle_core::events::{NoteOperationEnvelope, PresenceUpdate};
use huddle_core::{Error, ErrorCode, Result};
use huddle_test_utils::fixtures::{insert, joined, left, note_op};

struct Recorder<T> {
    batches: Mutex<Vec<(String, Vec<T>)>>,
    fail_groups: Mutex<HashSet<String>>,
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            fail_groups: Mutex::new(HashSet::new()),
        }
    }
}

impl<T: Clone> Recorder<T> {
    fn items(&self) -> Vec<T> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, items)| items.clone())
            .collect()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> BatchWriter<T> for Recorder<T> {
    async fn write_batch(&self, group: &str, items: &[T]) -> Result<()> {
        if self.fail_groups.lock().unwrap().contains(group) {
            return Err(Error::storage(format!("{group} unavailable")));
        }
        self.batches
            .lock()
            .unwrap()
            .push((group.to_string(), items.to_vec()));
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_write_each_operation_once() -> Result<()> {
    let writer = Arc::new(Recorder::<NoteOperationEnvelope>::default());
    let processor = Arc::new(CoalescingBatchProcessor::new(
        "note_ops",
        BatchConfig::new(16, 20),
        Arc::new(NoteSequenceOrdered),
        writer.clone(),
    )?);

    let producers: Vec<_> = (0..8u64)
        .map(|p| {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move {
                for i in 0..50u64 {
                    let seq = p * 1_000 + i;
                    let outcome = processor.add(note_op("m1", "u1", insert(0, "x"), seq, 0))?;
                    assert!(outcome.accepted);
                    if i % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                Ok::<_, Error>(())
            })
        })
        .collect();
    for producer in producers {
        producer.await.expect("producer task")?;
    }

    processor.shutdown().await?;
    let written = writer.items();
    assert_eq!(written.len(), 400);
    let unique: HashSet<u64> = written.iter().map(|op| op.server_sequence).collect();
    assert_eq!(unique.len(), 400);

    for (_, batch) in writer.batches.lock().unwrap().iter() {
        assert!(batch.windows(2).all(|w| w[0].server_sequence < w[1].server_sequence));
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_group_is_reported_and_healthy_groups_persist() -> Result<()> {
    let writer = Arc::new(Recorder::<PresenceUpdate>::default());
    writer.fail_groups.lock().unwrap().insert("m2".into());
    let handler = Arc::new(CollectingErrorHandler::<PresenceUpdate>::new());
    let processor = CoalescingBatchProcessor::with_error_handler(
        "presence",
        BatchConfig::new(50, 1_000),
        Arc::new(PresenceLastWriteWins),
        writer.clone(),
        handler.clone(),
    )?;

    processor.add(joined("m1", "u1", 0))?;
    processor.add(joined("m2", "u1", 0))?;
    processor.add(left("m2", "u1", 5))?;

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    assert_eq!(processor.queue_size()?, 0);
    assert_eq!(writer.items().len(), 1);
    let failures = handler.take()?;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].group, "m2");
    assert_eq!(failures[0].code, ErrorCode::Storage);
    assert_eq!(failures[0].items, vec![left("m2", "u1", 5)]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn manual_flush_after_timer_is_empty() -> Result<()> {
    let writer = Arc::new(Recorder::<PresenceUpdate>::default());
    let processor = CoalescingBatchProcessor::new(
        "presence",
        BatchConfig::new(50, 1_000),
        Arc::new(PresenceLastWriteWins),
        writer.clone(),
    )?;

    processor.add(joined("m1", "u1", 0))?;
    tokio::time::sleep(Duration::from_millis(1_001)).await;

    let report = processor.flush().await?;
    assert!(report.is_empty());
    assert_eq!(report.trigger, FlushTrigger::Manual);
    assert_eq!(writer.items().len(), 1);
    Ok(())
}

/// Panics on its first write, then records like [`Recorder`].
#[derive(Default)]
struct PanicsOnce {
    tripped: AtomicBool,
    inner: Recorder<PresenceUpdate>,
}

#[async_trait]
impl BatchWriter<PresenceUpdate> for PanicsOnce {
    async fn write_batch(&self, group: &str, items: &[PresenceUpdate]) -> Result<()> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            panic!("presence store exploded");
        }
        self.inner.write_batch(group, items).await
    }
}

#[tokio::test(start_paused = true)]
async fn writer_panic_does_not_stop_the_timer() -> Result<()> {
    let writer = Arc::new(PanicsOnce::default());
    let handler = Arc::new(CollectingErrorHandler::<PresenceUpdate>::new());
    let processor = CoalescingBatchProcessor::with_error_handler(
        "presence",
        BatchConfig::new(50, 100),
        Arc::new(PresenceLastWriteWins),
        writer.clone(),
        handler.clone(),
    )?;

    processor.add(joined("m1", "u1", 0))?;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(processor.queue_size()?, 0);
    let failures = handler.take()?;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].code, ErrorCode::Internal);
    assert_eq!(failures[0].items, vec![joined("m1", "u1", 0)]);

    let outcome = processor.add(joined("m1", "u2", 200))?;
    assert!(outcome.accepted);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(processor.queue_size()?, 0);
    assert_eq!(writer.inner.items(), vec![joined("m1", "u2", 200)]);
    Ok(())
}
