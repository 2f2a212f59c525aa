//! Durable per-meeting server sequence numbers.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use huddle_core::error::{Error, Result};
use huddle_core::id::MeetingId;
use huddle_core::storage::{
    StorageBackend, WritePrecondition, WriteResult, read_json, write_json,
};

use crate::metrics::record_cas_retry;
use crate::store::note_prefix;

const MAX_CAS_ATTEMPTS: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct SequenceCounter {
    value: u64,
}

/// Returns the counter path for a meeting.
#[must_use]
pub fn sequence_path(meeting_id: &MeetingId) -> String {
    format!("{}/sequence.json", note_prefix(meeting_id))
}

/// Hands out strictly increasing sequence numbers per meeting, starting at 1.
#[derive(Clone)]
pub struct SequenceAllocator {
    storage: Arc<dyn StorageBackend>,
}

impl fmt::Debug for SequenceAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceAllocator").finish_non_exhaustive()
    }
}

impl SequenceAllocator {
    /// Creates an allocator over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Allocates the next sequence number for `meeting_id`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store fails or the counter stays
    /// contended.
    pub async fn next(&self, meeting_id: &MeetingId) -> Result<u64> {
        let path = sequence_path(meeting_id);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let (next, precondition) =
                match read_json::<SequenceCounter, _>(self.storage.as_ref(), &path).await? {
                    None => (1, WritePrecondition::DoesNotExist),
                    Some((counter, version)) => {
                        (counter.value + 1, WritePrecondition::MatchesVersion(version))
                    }
                };

            match write_json(
                self.storage.as_ref(),
                &path,
                &SequenceCounter { value: next },
                precondition,
            )
            .await?
            {
                WriteResult::Success { .. } => return Ok(next),
                WriteResult::PreconditionFailed { .. } => record_cas_retry("sequence"),
            }
        }

        Err(Error::storage(format!(
            "sequence counter '{path}' stayed contended after {MAX_CAS_ATTEMPTS} attempts"
        )))
    }

    /// Returns the last allocated number, or 0 if none.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    pub async fn current(&self, meeting_id: &MeetingId) -> Result<u64> {
        Ok(
            read_json::<SequenceCounter, _>(self.storage.as_ref(), &sequence_path(meeting_id))
                .await?
                .map_or(0, |(counter, _)| counter.value),
        )
    }
}
