//! Dead-letter holding area for operations that exhausted their retries.
//!
//! Entries are kept in memory only and are lost on restart. Operators (or a
//! periodic task) drain them with [`DeadLetterQueue::remove`] and expire old
//! ones with [`DeadLetterQueue::cleanup`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use huddle_core::error::poison_err;
use huddle_core::{Clock, DeadLetterId, Error, Result, system_clock};

use crate::metrics::set_dead_letters;

/// A failed operation parked for inspection or replay.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    /// Entry identifier.
    pub id: DeadLetterId,
    /// Name of the operation that failed.
    pub operation_name: String,
    /// Operation input, as needed for a replay.
    pub payload: serde_json::Value,
    /// Rendered final error.
    pub error: String,
    /// Stable code of the final error.
    pub error_code: &'static str,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// When the entry was parked.
    pub created_at: DateTime<Utc>,
}

/// In-memory dead-letter map keyed by entry id.
#[derive(Debug)]
pub struct DeadLetterQueue {
    entries: RwLock<HashMap<DeadLetterId, DeadLetterEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(system_clock())
    }
}

impl DeadLetterQueue {
    /// Creates an empty queue using `clock` for entry timestamps.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Parks a failed operation and returns its entry id.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn add(
        &self,
        operation_name: impl Into<String>,
        payload: serde_json::Value,
        error: &Error,
        attempts: u32,
    ) -> Result<DeadLetterId> {
        let entry = DeadLetterEntry {
            id: DeadLetterId::generate(),
            operation_name: operation_name.into(),
            payload,
            error: error.to_string(),
            error_code: error.code().as_str(),
            attempts,
            created_at: self.clock.now(),
        };
        let id = entry.id;

        tracing::error!(
            dead_letter_id = %id,
            operation = %entry.operation_name,
            attempts,
            error = %entry.error,
            "operation moved to dead-letter queue"
        );

        let mut entries = self.entries.write().map_err(poison_err)?;
        entries.insert(id, entry);
        set_dead_letters(entries.len());
        drop(entries);
        Ok(id)
    }

    /// Returns the entry with `id`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>> {
        Ok(self.entries.read().map_err(poison_err)?.get(&id).cloned())
    }

    /// Returns every entry, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn get_all(&self) -> Result<Vec<DeadLetterEntry>> {
        let mut all: Vec<_> = self
            .entries
            .read()
            .map_err(poison_err)?
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    /// Removes and returns the entry with `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn remove(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        let removed = entries.remove(&id);
        set_dead_letters(entries.len());
        Ok(removed)
    }

    /// Drops entries older than `older_than` and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn cleanup(&self, older_than: Duration) -> Result<usize> {
        let retention = chrono::Duration::from_std(older_than)
            .map_err(|e| Error::validation(format!("invalid retention window: {e}")))?;
        let cutoff = self.clock.now() - retention;

        let mut entries = self.entries.write().map_err(poison_err)?;
        let before = entries.len();
        entries.retain(|_, entry| entry.created_at >= cutoff);
        let removed = before - entries.len();
        set_dead_letters(entries.len());
        drop(entries);

        if removed > 0 {
            tracing::info!(removed, "expired dead-letter entries");
        }
        Ok(removed)
    }

    /// Returns the number of parked entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.read().map_err(poison_err)?.len())
    }

    /// Returns `true` when nothing is parked.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::ManualClock;
    use serde_json::json;

    #[test]
    fn add_get_remove() -> Result<()> {
        let dlq = DeadLetterQueue::default();
        let id = dlq.add(
            "create_room",
            json!({"meetingId": "mtg_1"}),
            &Error::external("video", "503"),
            3,
        )?;

        let entry = dlq.get(id)?.expect("entry");
        assert_eq!(entry.operation_name, "create_room");
        assert_eq!(entry.attempts, 3);
        assert_eq!(entry.error_code, "EXTERNAL_SERVICE_ERROR");
        assert_eq!(entry.payload["meetingId"], "mtg_1");

        assert_eq!(dlq.remove(id)?.map(|e| e.id), Some(id));
        assert!(dlq.get(id)?.is_none());
        assert!(dlq.is_empty()?);
        Ok(())
    }

    #[test]
    fn cleanup_removes_only_expired_entries() -> Result<()> {
        let clock = Arc::new(ManualClock::at_millis(1_700_000_000_000));
        let dlq = DeadLetterQueue::new(clock.clone());
        let err = Error::external("embeddings", "down");

        let old = dlq.add("embed", json!(1), &err, 3)?;
        clock.advance(Duration::from_secs(3_600));
        let fresh = dlq.add("embed", json!(2), &err, 3)?;
        clock.advance(Duration::from_secs(60));

        assert_eq!(dlq.cleanup(Duration::from_secs(1_800))?, 1);
        assert!(dlq.get(old)?.is_none());
        assert!(dlq.get(fresh)?.is_some());

        let all = dlq.get_all()?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, fresh);
        Ok(())
    }

    #[test]
    fn get_all_is_oldest_first() -> Result<()> {
        let clock = Arc::new(ManualClock::at_millis(0));
        let dlq = DeadLetterQueue::new(clock.clone());
        let err = Error::storage("unavailable");

        let first = dlq.add("a", json!(null), &err, 1)?;
        clock.advance(Duration::from_millis(5));
        let second = dlq.add("b", json!(null), &err, 1)?;

        let ids: Vec<_> = dlq.get_all()?.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first, second]);
        Ok(())
    }
}
