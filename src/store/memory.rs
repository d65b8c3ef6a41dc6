//! In-process session store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::{SessionStore, StoreError};
use crate::session::types::SessionMetadata;

/// Lowest latency backend; metadata is lost on restart and invisible to
/// other processes.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<Uuid, SessionMetadata>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_session<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut SessionMetadata) -> T,
    ) -> Result<T, StoreError> {
        let mut entry = self.sessions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        Ok(f(entry.value_mut()))
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, meta: &SessionMetadata) -> Result<(), StoreError> {
        match self.sessions.entry(meta.id) {
            Entry::Occupied(_) => Err(StoreError::Conflict(meta.id)),
            Entry::Vacant(slot) => {
                slot.insert(meta.clone());
                Ok(())
            }
        }
    }

    async fn get_session(&self, id: Uuid) -> Result<SessionMetadata, StoreError> {
        self.sessions
            .get(&id)
            .map(|m| m.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_active_sessions(&self) -> Result<Vec<SessionMetadata>, StoreError> {
        Ok(self
            .sessions
            .iter()
            .filter(|m| m.is_active)
            .map(|m| m.value().clone())
            .collect())
    }

    async fn update_session_activity(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_session(id, |m| m.last_activity = m.last_activity.max(at))
    }

    async fn remove_session(&self, id: Uuid) -> Result<(), StoreError> {
        self.sessions
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn mark_session_inactive(&self, id: Uuid) -> Result<(), StoreError> {
        self.with_session(id, |m| m.is_active = false)
    }

    async fn reactivate_session(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.with_session(id, |m| {
            m.is_active = true;
            m.last_activity = m.last_activity.max(at);
        })
    }
}
