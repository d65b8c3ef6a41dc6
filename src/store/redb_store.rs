//! Embedded session store using redb + MessagePack (rmp-serde)
//!
//! Durable across restarts on one node. redb holds an exclusive file lock,
//! so a database file belongs to a single relay process.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{info, warn};
use uuid::Uuid;

use super::{SessionStore, StoreError};
use crate::session::types::SessionMetadata;

/// Table: session_id (string) -> SessionMetadata (MessagePack)
const SESSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("ssh_sessions");

macro_rules! backend_error {
    ($($ty:ty),*) => {
        $(impl From<$ty> for StoreError {
            fn from(e: $ty) -> Self {
                StoreError::Backend(e.to_string())
            }
        })*
    };
}

backend_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

pub struct RedbSessionStore {
    db: Arc<Database>,
}

impl RedbSessionStore {
    pub async fn open(path: PathBuf) -> Result<Self, StoreError> {
        let db = tokio::task::spawn_blocking(move || Self::open_blocking(path))
            .await
            .map_err(|e| StoreError::Backend(format!("Task join error: {}", e)))??;
        Ok(Self { db: Arc::new(db) })
    }

    fn open_blocking(path: PathBuf) -> Result<Database, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("create {:?}: {}", parent, e)))?;
        }
        let db = Database::create(&path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            {
                warn!("Failed to set session database permissions: {}", e);
            }
        }

        // Create table up front so read transactions never see it missing
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SESSIONS_TABLE)?;
        }
        write_txn.commit()?;

        info!("Session database opened at {:?}", path);
        Ok(db)
    }

    /// Run `f` on the blocking pool with a handle to the database.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Backend(format!("Task join error: {}", e)))?
    }

    /// Read-modify-write one record inside a single write transaction.
    async fn modify(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut SessionMetadata) + Send + 'static,
    ) -> Result<(), StoreError> {
        self.blocking(move |db| {
            let key = id.to_string();
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(SESSIONS_TABLE)?;
                let mut meta: SessionMetadata = match table.get(key.as_str())? {
                    Some(v) => rmp_serde::from_slice(v.value())?,
                    None => return Err(StoreError::NotFound(id)),
                };
                f(&mut meta);
                let bytes = rmp_serde::to_vec(&meta)?;
                table.insert(key.as_str(), bytes.as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SessionStore for RedbSessionStore {
    async fn create_session(&self, meta: &SessionMetadata) -> Result<(), StoreError> {
        let meta = meta.clone();
        self.blocking(move |db| {
            let key = meta.id.to_string();
            let bytes = rmp_serde::to_vec(&meta)?;
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(SESSIONS_TABLE)?;
                if table.get(key.as_str())?.is_some() {
                    return Err(StoreError::Conflict(meta.id));
                }
                table.insert(key.as_str(), bytes.as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, id: Uuid) -> Result<SessionMetadata, StoreError> {
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(SESSIONS_TABLE)?;
            let key = id.to_string();
            let found: Option<SessionMetadata> = match table.get(key.as_str())? {
                Some(v) => Some(rmp_serde::from_slice(v.value())?),
                None => None,
            };
            found.ok_or(StoreError::NotFound(id))
        })
        .await
    }

    async fn list_active_sessions(&self) -> Result<Vec<SessionMetadata>, StoreError> {
        self.blocking(|db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(SESSIONS_TABLE)?;
            let mut sessions = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                let meta: SessionMetadata = rmp_serde::from_slice(value.value())?;
                if meta.is_active {
                    sessions.push(meta);
                }
            }
            sessions.sort_by_key(|m| m.created_at);
            Ok(sessions)
        })
        .await
    }

    async fn update_session_activity(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.modify(id, move |m| m.last_activity = m.last_activity.max(at))
            .await
    }

    async fn remove_session(&self, id: Uuid) -> Result<(), StoreError> {
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            let removed = {
                let mut table = write_txn.open_table(SESSIONS_TABLE)?;
                let removed = table.remove(id.to_string().as_str())?.is_some();
                removed
            };
            write_txn.commit()?;
            if removed {
                Ok(())
            } else {
                Err(StoreError::NotFound(id))
            }
        })
        .await
    }

    async fn mark_session_inactive(&self, id: Uuid) -> Result<(), StoreError> {
        self.modify(id, |m| m.is_active = false).await
    }

    async fn reactivate_session(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.modify(id, move |m| {
            m.is_active = true;
            m.last_activity = m.last_activity.max(at);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_redb_store_conformance() {
        let dir = tempdir().unwrap();
        let store = RedbSessionStore::open(dir.path().join("sessions.redb"))
            .await
            .unwrap();
        conformance::run(&store).await;
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.redb");
        let meta = conformance::sample();

        {
            let store = RedbSessionStore::open(path.clone()).await.unwrap();
            store.create_session(&meta).await.unwrap();
            store.mark_session_inactive(meta.id).await.unwrap();
        }

        let store = RedbSessionStore::open(path).await.unwrap();
        let fetched = store.get_session(meta.id).await.unwrap();
        assert_eq!(fetched.username, "deploy");
        assert!(!fetched.is_active);
    }
}
