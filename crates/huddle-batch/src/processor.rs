//! The coalescing batch processor.
//!
//! `add` is synchronous and never waits on I/O: it appends to an in-memory
//! queue under a short critical section. A background task owned by the
//! processor flushes when the queue reaches `max_batch_size` or when the
//! oldest item has waited `max_wait`. A flush drains the whole queue
//! atomically, coalesces it, then calls the [`BatchWriter`] once per group
//! with groups written concurrently.
//!
//! Flushes are serialized so that a later flush never overtakes an earlier
//! one for the same aggregate. Writer failures and panics are handed to a
//! [`BatchErrorHandler`] and never escape the flush loop.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use huddle_core::error::poison_err;
use huddle_core::{Error, ErrorCode, Result};

use crate::coalesce::{CoalescingRule, Group, coalesce};
use crate::metrics::BatchMetrics;
use crate::queue::{BatchConfig, BatchQueue, FlushTrigger};

/// Persists one group of coalesced items.
#[async_trait]
pub trait BatchWriter<T>: Send + Sync + 'static {
    /// Writes `items` for the aggregate `group`.
    ///
    /// Items arrive in the order produced by the coalescing rule.
    async fn write_batch(&self, group: &str, items: &[T]) -> Result<()>;
}

/// A group whose write failed.
#[derive(Debug)]
pub struct FlushFailure<T> {
    /// Processor name.
    pub processor: String,
    /// Aggregate key of the group.
    pub group: String,
    /// The writer's error.
    pub error: Error,
    /// The items that were not written.
    pub items: Vec<T>,
}

/// Receives failed groups.
#[async_trait]
pub trait BatchErrorHandler<T>: Send + Sync + 'static {
    /// Handles one failed group.
    async fn handle(&self, failure: FlushFailure<T>);
}

/// Default handler: log the failure and drop the items.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAndDrop;

#[async_trait]
impl<T: Send + 'static> BatchErrorHandler<T> for LogAndDrop {
    async fn handle(&self, failure: FlushFailure<T>) {
        tracing::error!(
            processor = %failure.processor,
            group = %failure.group,
            dropped = failure.items.len(),
            code = %failure.error.code(),
            error = %failure.error,
            "batch write failed; dropping items"
        );
    }
}

/// A recorded failure, as kept by [`CollectingErrorHandler`].
#[derive(Debug, Clone)]
pub struct RecordedFailure<T> {
    /// Aggregate key of the group.
    pub group: String,
    /// Code of the writer's error.
    pub code: ErrorCode,
    /// Rendered writer error.
    pub message: String,
    /// The items that were not written.
    pub items: Vec<T>,
}

/// Handler that keeps failed groups in memory for later inspection or replay.
#[derive(Debug)]
pub struct CollectingErrorHandler<T> {
    failures: Mutex<Vec<RecordedFailure<T>>>,
}

impl<T> Default for CollectingErrorHandler<T> {
    fn default() -> Self {
        Self {
            failures: Mutex::new(Vec::new()),
        }
    }
}

impl<T> CollectingErrorHandler<T> {
    /// Creates an empty handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns every recorded failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn take(&self) -> Result<Vec<RecordedFailure<T>>> {
        Ok(std::mem::take(&mut *self.failures.lock().map_err(poison_err)?))
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> BatchErrorHandler<T> for CollectingErrorHandler<T> {
    async fn handle(&self, failure: FlushFailure<T>) {
        tracing::warn!(
            processor = %failure.processor,
            group = %failure.group,
            items = failure.items.len(),
            error = %failure.error,
            "batch write failed; keeping items"
        );
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(RecordedFailure {
                group: failure.group,
                code: failure.error.code(),
                message: failure.error.to_string(),
                items: failure.items,
            });
        }
    }
}

/// Result of [`CoalescingBatchProcessor::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOutcome {
    /// Whether the item was queued. `false` only after shutdown began.
    pub accepted: bool,
    /// Pending depth after the call.
    pub queue_depth: usize,
}

/// Summary of one flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    /// Why the flush ran.
    pub trigger: FlushTrigger,
    /// Items drained from the queue.
    pub drained: usize,
    /// Items left after coalescing.
    pub coalesced: usize,
    /// Groups handed to the writer.
    pub groups: usize,
    /// Items in groups the writer accepted.
    pub written: usize,
    /// Groups the writer rejected.
    pub failed_groups: usize,
}

impl FlushReport {
    fn empty(trigger: FlushTrigger) -> Self {
        Self {
            trigger,
            drained: 0,
            coalesced: 0,
            groups: 0,
            written: 0,
            failed_groups: 0,
        }
    }

    /// Returns `true` if the flush found nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.drained == 0
    }
}

struct State<T> {
    queue: BatchQueue<T>,
    closed: bool,
}

struct Inner<T> {
    name: String,
    config: BatchConfig,
    state: Mutex<State<T>>,
    rule: Arc<dyn CoalescingRule<T>>,
    writer: Arc<dyn BatchWriter<T>>,
    error_handler: Arc<dyn BatchErrorHandler<T>>,
    wake: Notify,
    flush_gate: tokio::sync::Mutex<()>,
    metrics: BatchMetrics,
}

enum GroupOutcome {
    Written(usize),
    Failed,
}

impl<T: Send + Sync + 'static> Inner<T> {
    fn lock_state(&self) -> Result<MutexGuard<'_, State<T>>> {
        self.state.lock().map_err(poison_err)
    }

    async fn flush(&self, trigger: FlushTrigger) -> Result<FlushReport> {
        let _gate = self.flush_gate.lock().await;

        let drained = {
            let mut state = self.lock_state()?;
            state.queue.drain()
        };
        self.metrics.set_queue_depth(self.lock_state()?.queue.len());
        if drained.is_empty() {
            return Ok(FlushReport::empty(trigger));
        }

        let started = Instant::now();
        let oldest_wait = drained
            .first()
            .map(|q| started.saturating_duration_since(q.enqueued_at))
            .unwrap_or_default();
        let batch = coalesce(self.rule.as_ref(), drained.into_iter().map(|q| q.item).collect());
        let drained = batch.input_len;
        let coalesced = batch.output_len();
        let groups = batch.groups.len();

        let outcomes = join_all(
            batch
                .groups
                .into_iter()
                .map(|group| self.write_group(group)),
        )
        .await;

        let mut report = FlushReport {
            trigger,
            drained,
            coalesced,
            groups,
            written: 0,
            failed_groups: 0,
        };
        for outcome in outcomes {
            match outcome {
                GroupOutcome::Written(n) => report.written += n,
                GroupOutcome::Failed => report.failed_groups += 1,
            }
        }

        let elapsed = started.elapsed();
        self.metrics
            .record_flush(trigger.as_str(), elapsed, drained, coalesced);
        tracing::debug!(
            processor = %self.name,
            %trigger,
            drained,
            coalesced,
            groups,
            failed_groups = report.failed_groups,
            oldest_wait_ms = u64::try_from(oldest_wait.as_millis()).unwrap_or(u64::MAX),
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "flushed batch"
        );
        Ok(report)
    }

    async fn write_group(&self, group: Group<T>) -> GroupOutcome {
        let span = tracing::info_span!("batch_write", processor = %self.name, group = %group.key);
        let len = group.items.len();
        let written = AssertUnwindSafe(
            self.writer
                .write_batch(&group.key, &group.items)
                .instrument(span),
        )
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            Err(Error::internal(format!(
                "batch writer panicked: {}",
                panic_payload_to_string(payload.as_ref())
            )))
        });
        match written {
            Ok(()) => GroupOutcome::Written(len),
            Err(error) => {
                self.metrics.record_write_failure();
                self.error_handler
                    .handle(FlushFailure {
                        processor: self.name.clone(),
                        group: group.key,
                        error,
                        items: group.items,
                    })
                    .await;
                GroupOutcome::Failed
            }
        }
    }

    /// Returns the flush to run now, the instant to wake up at, or neither.
    fn poll_due(&self) -> Result<(Option<FlushTrigger>, Option<Instant>, bool)> {
        let state = self.lock_state()?;
        let now = Instant::now();
        Ok((
            state.queue.flush_due(&self.config, now),
            state.queue.next_deadline(&self.config),
            state.closed,
        ))
    }

    async fn run_timer(self: Arc<Self>) {
        loop {
            let (due, deadline, closed) = match self.poll_due() {
                Ok(polled) => polled,
                Err(e) => {
                    tracing::error!(processor = %self.name, error = %e, "flush timer stopped");
                    return;
                }
            };
            if closed {
                return;
            }
            if let Some(trigger) = due {
                if let Err(e) = self.flush(trigger).await {
                    tracing::error!(processor = %self.name, error = %e, "timed flush failed");
                }
                continue;
            }
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(deadline) => {}
                        () = self.wake.notified() => {}
                    }
                }
                None => self.wake.notified().await,
            }
        }
    }
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Queue + coalescing rule + writer, flushed by size or age.
pub struct CoalescingBatchProcessor<T: Send + Sync + 'static> {
    inner: Arc<Inner<T>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> std::fmt::Debug for CoalescingBatchProcessor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalescingBatchProcessor")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("rule", &self.inner.rule.name())
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> CoalescingBatchProcessor<T> {
    /// Creates a processor that logs and drops failed groups.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn new(
        name: impl Into<String>,
        config: BatchConfig,
        rule: Arc<dyn CoalescingRule<T>>,
        writer: Arc<dyn BatchWriter<T>>,
    ) -> Result<Self> {
        Self::with_error_handler(name, config, rule, writer, Arc::new(LogAndDrop))
    }

    /// Creates a processor with a custom failure handler.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn with_error_handler(
        name: impl Into<String>,
        config: BatchConfig,
        rule: Arc<dyn CoalescingRule<T>>,
        writer: Arc<dyn BatchWriter<T>>,
        error_handler: Arc<dyn BatchErrorHandler<T>>,
    ) -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::internal(format!("batch processor needs a tokio runtime: {e}")))?;
        let name = name.into();
        let inner = Arc::new(Inner {
            metrics: BatchMetrics::new(name.clone()),
            name,
            config,
            state: Mutex::new(State {
                queue: BatchQueue::new(),
                closed: false,
            }),
            rule,
            writer,
            error_handler,
            wake: Notify::new(),
            flush_gate: tokio::sync::Mutex::new(()),
        });
        let timer = handle.spawn(Arc::clone(&inner).run_timer());
        Ok(Self {
            inner,
            timer: Mutex::new(Some(timer)),
        })
    }

    /// Returns the processor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the flush thresholds.
    #[must_use]
    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Queues an item.
    ///
    /// Never waits. Reaching `max_batch_size` wakes the flush task immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn add(&self, item: T) -> Result<AddOutcome> {
        let mut state = self.inner.lock_state()?;
        if state.closed {
            let queue_depth = state.queue.len();
            drop(state);
            self.inner.metrics.record_enqueue(false);
            return Ok(AddOutcome {
                accepted: false,
                queue_depth,
            });
        }
        let queue_depth = state.queue.push(item, Instant::now());
        drop(state);

        self.inner.metrics.record_enqueue(true);
        self.inner.metrics.set_queue_depth(queue_depth);
        // First item arms the age timer; a full queue flushes now.
        if queue_depth == 1 || queue_depth >= self.inner.config.max_batch_size {
            self.inner.wake.notify_one();
        }
        Ok(AddOutcome {
            accepted: true,
            queue_depth,
        })
    }

    /// Returns the number of items waiting for a flush.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn queue_size(&self) -> Result<usize> {
        Ok(self.inner.lock_state()?.queue.len())
    }

    /// Flushes everything pending now.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned. Writer failures are
    /// reported through the error handler and counted in the report instead.
    pub async fn flush(&self) -> Result<FlushReport> {
        self.inner.flush(FlushTrigger::Manual).await
    }

    /// Stops accepting items, flushes what is pending and stops the timer.
    ///
    /// Safe to call more than once; later calls wait for any in-progress
    /// flush and return an empty report.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub async fn shutdown(&self) -> Result<FlushReport> {
        let first = {
            let mut state = self.inner.lock_state()?;
            !std::mem::replace(&mut state.closed, true)
        };
        if first {
            tracing::info!(processor = %self.inner.name, "shutting down batch processor");
            self.inner.wake.notify_one();
            let timer = self.timer.lock().map_err(poison_err)?.take();
            if let Some(timer) = timer {
                if let Err(e) = timer.await {
                    tracing::warn!(processor = %self.inner.name, error = %e, "flush timer ended abnormally");
                }
            }
        }
        self.inner.flush(FlushTrigger::Shutdown).await
    }

    /// Returns `true` once shutdown has begun.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn is_shut_down(&self) -> Result<bool> {
        Ok(self.inner.lock_state()?.closed)
    }
}

impl<T: Send + Sync + 'static> Drop for CoalescingBatchProcessor<T> {
    fn drop(&mut self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(timer) = timer.take() {
                timer.abort();
            }
        }
    }
}
