//! Session metadata persistence
//!
//! [`SessionStore`] holds metadata only, never live transports. Backends:
//! - [`MemorySessionStore`]: in-process map, no durability
//! - [`SqliteSessionStore`]: relational table via sqlx, source of truth across restarts
//! - [`RedbSessionStore`]: embedded key-value file (redb + MessagePack)
//! - [`RedisSessionStore`]: shared cache for multi-process deployments

mod memory;
mod redb_store;
mod redis_store;
mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::session::types::SessionMetadata;

pub use memory::MemorySessionStore;
pub use redb_store::RedbSessionStore;
pub use redis_store::RedisSessionStore;
pub use sqlite::SqliteSessionStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session already exists: {0}")]
    Conflict(Uuid),

    #[error("Session not found: {0}")]
    NotFound(Uuid),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Cluster-wide session metadata. Implementations must be safe for
/// concurrent use from several relay processes.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert; `Conflict` if the id exists.
    async fn create_session(&self, meta: &SessionMetadata) -> Result<(), StoreError>;

    async fn get_session(&self, id: Uuid) -> Result<SessionMetadata, StoreError>;

    async fn list_active_sessions(&self) -> Result<Vec<SessionMetadata>, StoreError>;

    /// Advance `last_activity`; an older timestamp never moves it back.
    async fn update_session_activity(&self, id: Uuid, at: DateTime<Utc>)
        -> Result<(), StoreError>;

    /// Hard delete.
    async fn remove_session(&self, id: Uuid) -> Result<(), StoreError>;

    /// Soft disable; the row stays for audit.
    async fn mark_session_inactive(&self, id: Uuid) -> Result<(), StoreError>;

    /// Flag active again and advance `last_activity` (rehydration).
    async fn reactivate_session(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Mark every active session idle since before `cutoff` inactive.
    async fn mark_idle_inactive(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut marked = 0;
        for meta in self.list_active_sessions().await? {
            if meta.last_activity < cutoff {
                match self.mark_session_inactive(meta.id).await {
                    Ok(()) => marked += 1,
                    // Removed concurrently
                    Err(StoreError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(marked)
    }
}

/// Backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    #[default]
    Memory,
    /// e.g. `sqlite:///var/lib/ssh-relay/sessions.db`
    Sqlite { url: String },
    Redb { path: PathBuf },
    /// e.g. `redis://127.0.0.1:6379/0`
    Redis { url: String },
}

pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn SessionStore>, StoreError> {
    let store: Arc<dyn SessionStore> = match config {
        StoreConfig::Memory => Arc::new(MemorySessionStore::new()),
        StoreConfig::Sqlite { url } => Arc::new(SqliteSessionStore::connect(url).await?),
        StoreConfig::Redb { path } => Arc::new(RedbSessionStore::open(path.clone()).await?),
        StoreConfig::Redis { url } => Arc::new(RedisSessionStore::connect(url).await?),
    };
    info!("Session store ready ({:?})", config);
    Ok(store)
}
