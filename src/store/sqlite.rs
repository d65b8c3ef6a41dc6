//! Relational session store (sqlx over SQLite)

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;
use uuid::Uuid;

use super::{SessionStore, StoreError};
use crate::session::types::SessionMetadata;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ssh_sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    host_server_id TEXT NOT NULL,
    username TEXT NOT NULL,
    client_ip TEXT,
    user_agent TEXT,
    created_at INTEGER NOT NULL,
    last_activity INTEGER NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1
)"#;

const ACTIVE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_ssh_sessions_active ON ssh_sessions (is_active, last_activity)";

const SELECT_COLUMNS: &str = "SELECT id, user_id, host_server_id, username, client_ip, user_agent, \
     created_at, last_activity, is_active FROM ssh_sessions";

// Internal row mapping; timestamps are unix millis
#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: String,
    user_id: String,
    host_server_id: String,
    username: String,
    client_ip: Option<String>,
    user_agent: Option<String>,
    created_at: i64,
    last_activity: i64,
    is_active: bool,
}

impl SessionRow {
    fn into_metadata(self) -> Result<SessionMetadata, StoreError> {
        Ok(SessionMetadata {
            id: parse_uuid(&self.id)?,
            user_id: parse_uuid(&self.user_id)?,
            host_server_id: parse_uuid(&self.host_server_id)?,
            username: self.username,
            client_ip: self.client_ip,
            user_agent: self.user_agent,
            created_at: from_millis(self.created_at)?,
            last_activity: from_millis(self.last_activity)?,
            is_active: self.is_active,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Serialization(format!("bad uuid {s}: {e}")))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {ms}")))
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct SqliteSessionStore {
    pool: Pool<Sqlite>,
}

impl SqliteSessionStore {
    /// Open (creating if missing) the database at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str(url)
            .map_err(backend)?
            .create_if_missing(true);

        // Every connection to an in-memory database is a separate database
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await
            .map_err(backend)?;

        sqlx::query(SCHEMA).execute(&pool).await.map_err(backend)?;
        sqlx::query(ACTIVE_INDEX)
            .execute(&pool)
            .await
            .map_err(backend)?;

        info!("SQLite session store opened at {}", url);
        Ok(Self { pool })
    }

    pub async fn open_file(path: &std::path::Path) -> Result<Self, StoreError> {
        Self::connect(&format!("sqlite://{}", path.display())).await
    }

    fn expect_row(id: Uuid, rows_affected: u64) -> Result<(), StoreError> {
        if rows_affected == 0 {
            Err(StoreError::NotFound(id))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, meta: &SessionMetadata) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO ssh_sessions (id, user_id, host_server_id, username, client_ip, \
             user_agent, created_at, last_activity, is_active) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(meta.id.to_string())
        .bind(meta.user_id.to_string())
        .bind(meta.host_server_id.to_string())
        .bind(&meta.username)
        .bind(&meta.client_ip)
        .bind(&meta.user_agent)
        .bind(meta.created_at.timestamp_millis())
        .bind(meta.last_activity.timestamp_millis())
        .bind(meta.is_active)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Conflict(meta.id))
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn get_session(&self, id: Uuid) -> Result<SessionMetadata, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        sqlx::query_as::<_, SessionRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or(StoreError::NotFound(id))?
            .into_metadata()
    }

    async fn list_active_sessions(&self) -> Result<Vec<SessionMetadata>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE is_active = 1 ORDER BY created_at");
        sqlx::query_as::<_, SessionRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?
            .into_iter()
            .map(SessionRow::into_metadata)
            .collect()
    }

    async fn update_session_activity(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE ssh_sessions SET last_activity = MAX(last_activity, ?1) WHERE id = ?2",
        )
        .bind(at.timestamp_millis())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Self::expect_row(id, result.rows_affected())
    }

    async fn remove_session(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM ssh_sessions WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Self::expect_row(id, result.rows_affected())
    }

    async fn mark_session_inactive(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE ssh_sessions SET is_active = 0 WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Self::expect_row(id, result.rows_affected())
    }

    async fn reactivate_session(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE ssh_sessions SET is_active = 1, last_activity = MAX(last_activity, ?1) \
             WHERE id = ?2",
        )
        .bind(at.timestamp_millis())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Self::expect_row(id, result.rows_affected())
    }

    async fn mark_idle_inactive(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "UPDATE ssh_sessions SET is_active = 0 WHERE is_active = 1 AND last_activity < ?1",
        )
        .bind(cutoff.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() as usize)
    }
}
