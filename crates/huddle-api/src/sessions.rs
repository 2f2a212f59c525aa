//! Meeting session lookup.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use huddle_core::MeetingId;
use huddle_core::error::{Result, poison_err};

/// Answers whether a meeting currently accepts live events.
#[async_trait]
pub trait MeetingSessions: Send + Sync + 'static {
    /// Returns `true` if `meeting_id` has an active session.
    async fn is_active(&self, meeting_id: &MeetingId) -> Result<bool>;
}

/// Session registry held in memory, for tests and single-node development.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessions {
    active: Arc<RwLock<HashSet<MeetingId>>>,
}

impl InMemorySessions {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `meeting_id` active.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn start(&self, meeting_id: MeetingId) -> Result<()> {
        self.active.write().map_err(poison_err)?.insert(meeting_id);
        Ok(())
    }

    /// Marks `meeting_id` ended. Returns whether it was active.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn end(&self, meeting_id: &MeetingId) -> Result<bool> {
        Ok(self.active.write().map_err(poison_err)?.remove(meeting_id))
    }
}

#[async_trait]
impl MeetingSessions for InMemorySessions {
    async fn is_active(&self, meeting_id: &MeetingId) -> Result<bool> {
        Ok(self.active.read().map_err(poison_err)?.contains(meeting_id))
    }
}
