//! Shared session store on Redis
//!
//! Each session is a hash at `ssh_session:{id}`; active ids are kept in the
//! `ssh_sessions:active` set. Writes that read before they modify run as
//! Lua scripts so concurrent relays cannot interleave them.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tokio::time::timeout;
use tracing::{debug, info};
use uuid::Uuid;

use super::{SessionStore, StoreError};
use crate::session::types::SessionMetadata;

const KEY_PREFIX: &str = "ssh_session:";
const ACTIVE_SET: &str = "ssh_sessions:active";
const OP_TIMEOUT: Duration = Duration::from_secs(2);

/// KEYS[1]=session hash, KEYS[2]=active set; ARGV[1]=id, ARGV[2]=active flag, ARGV[3..]=fields
const CREATE_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], unpack(ARGV, 3))
if ARGV[2] == '1' then redis.call('SADD', KEYS[2], ARGV[1]) end
return 1
"#;

/// KEYS[1]=session hash; ARGV[1]=millis
const TOUCH_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
local cur = tonumber(redis.call('HGET', KEYS[1], 'last_activity') or '0')
if tonumber(ARGV[1]) > cur then redis.call('HSET', KEYS[1], 'last_activity', ARGV[1]) end
return 1
"#;

/// KEYS[1]=session hash, KEYS[2]=active set; ARGV[1]=id, ARGV[2]=flag, ARGV[3]=millis or ''
const SET_ACTIVE_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('HSET', KEYS[1], 'is_active', ARGV[2])
if ARGV[2] == '1' then
  redis.call('SADD', KEYS[2], ARGV[1])
  local cur = tonumber(redis.call('HGET', KEYS[1], 'last_activity') or '0')
  if ARGV[3] ~= '' and tonumber(ARGV[3]) > cur then
    redis.call('HSET', KEYS[1], 'last_activity', ARGV[3])
  end
else
  redis.call('SREM', KEYS[2], ARGV[1])
end
return 1
"#;

/// KEYS[1]=active set; ARGV[1]=hash key prefix, ARGV[2]=cutoff millis
const SWEEP_IDLE_LUA: &str = r#"
local marked = 0
for _, id in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  local key = ARGV[1] .. id
  local last = redis.call('HGET', key, 'last_activity')
  if not last then
    redis.call('SREM', KEYS[1], id)
  elseif tonumber(last) < tonumber(ARGV[2]) then
    redis.call('HSET', key, 'is_active', '0')
    redis.call('SREM', KEYS[1], id)
    marked = marked + 1
  end
end
return marked
"#;

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

fn session_key(id: Uuid) -> String {
    format!("{KEY_PREFIX}{id}")
}

fn to_fields(meta: &SessionMetadata) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("id", meta.id.to_string()),
        ("user_id", meta.user_id.to_string()),
        ("host_server_id", meta.host_server_id.to_string()),
        ("username", meta.username.clone()),
        ("created_at", meta.created_at.timestamp_millis().to_string()),
        ("last_activity", meta.last_activity.timestamp_millis().to_string()),
        ("is_active", if meta.is_active { "1" } else { "0" }.to_string()),
    ];
    if let Some(ip) = &meta.client_ip {
        fields.push(("client_ip", ip.clone()));
    }
    if let Some(ua) = &meta.user_agent {
        fields.push(("user_agent", ua.clone()));
    }
    fields
}

fn from_fields(mut fields: HashMap<String, String>) -> Result<SessionMetadata, StoreError> {
    fn take(fields: &mut HashMap<String, String>, name: &str) -> Result<String, StoreError> {
        fields
            .remove(name)
            .ok_or_else(|| StoreError::Serialization(format!("missing field {name}")))
    }
    fn uuid(s: String) -> Result<Uuid, StoreError> {
        Uuid::parse_str(&s).map_err(|e| StoreError::Serialization(e.to_string()))
    }
    fn millis(s: String) -> Result<DateTime<Utc>, StoreError> {
        s.parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| StoreError::Serialization(format!("bad timestamp {s}")))
    }

    Ok(SessionMetadata {
        id: uuid(take(&mut fields, "id")?)?,
        user_id: uuid(take(&mut fields, "user_id")?)?,
        host_server_id: uuid(take(&mut fields, "host_server_id")?)?,
        username: take(&mut fields, "username")?,
        client_ip: fields.remove("client_ip"),
        user_agent: fields.remove("user_agent"),
        created_at: millis(take(&mut fields, "created_at")?)?,
        last_activity: millis(take(&mut fields, "last_activity")?)?,
        is_active: take(&mut fields, "is_active")? == "1",
    })
}

pub struct RedisSessionStore {
    conn: MultiplexedConnection,
    create_script: Script,
    touch_script: Script,
    set_active_script: Script,
    sweep_idle_script: Script,
}

impl RedisSessionStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = timeout(OP_TIMEOUT, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| StoreError::Backend("redis connect timeout".to_string()))??;
        info!("Redis session store connected");
        Ok(Self {
            conn,
            create_script: Script::new(CREATE_LUA),
            touch_script: Script::new(TOUCH_LUA),
            set_active_script: Script::new(SET_ACTIVE_LUA),
            sweep_idle_script: Script::new(SWEEP_IDLE_LUA),
        })
    }

    async fn bounded<T>(
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, StoreError> {
        timeout(OP_TIMEOUT, fut)
            .await
            .map_err(|_| StoreError::Backend("redis timeout".to_string()))?
            .map_err(StoreError::from)
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<SessionMetadata>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            Self::bounded(conn.hgetall(session_key(id))).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        from_fields(fields).map(Some)
    }

    async fn set_active(
        &self,
        id: Uuid,
        active: bool,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.set_active_script.key(session_key(id));
        invocation
            .key(ACTIVE_SET)
            .arg(id.to_string())
            .arg(if active { "1" } else { "0" })
            .arg(at.map(|t| t.timestamp_millis().to_string()).unwrap_or_default());
        let updated: i64 = Self::bounded(invocation.invoke_async(&mut conn)).await?;
        if updated == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create_session(&self, meta: &SessionMetadata) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.create_script.key(session_key(meta.id));
        invocation
            .key(ACTIVE_SET)
            .arg(meta.id.to_string())
            .arg(if meta.is_active { "1" } else { "0" });
        for (name, value) in to_fields(meta) {
            invocation.arg(name).arg(value);
        }
        let created: i64 = Self::bounded(invocation.invoke_async(&mut conn)).await?;
        if created == 0 {
            return Err(StoreError::Conflict(meta.id));
        }
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<SessionMetadata, StoreError> {
        self.fetch(id).await?.ok_or(StoreError::NotFound(id))
    }

    async fn list_active_sessions(&self) -> Result<Vec<SessionMetadata>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = Self::bounded(conn.smembers(ACTIVE_SET)).await?;

        let mut sessions = Vec::with_capacity(ids.len());
        for raw in ids {
            let Ok(id) = Uuid::parse_str(&raw) else {
                continue;
            };
            match self.fetch(id).await? {
                Some(meta) if meta.is_active => sessions.push(meta),
                _ => {
                    // Hash expired or deleted under us
                    debug!("Pruning stale active entry {}", id);
                    let _: i64 = Self::bounded(conn.srem(ACTIVE_SET, &raw)).await?;
                }
            }
        }
        sessions.sort_by_key(|m| m.created_at);
        Ok(sessions)
    }

    async fn update_session_activity(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.touch_script.key(session_key(id));
        invocation.arg(at.timestamp_millis());
        let updated: i64 = Self::bounded(invocation.invoke_async(&mut conn)).await?;
        if updated == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn remove_session(&self, id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let (deleted, _): (i64, i64) = Self::bounded(
            redis::pipe()
                .atomic()
                .del(session_key(id))
                .srem(ACTIVE_SET, id.to_string())
                .query_async(&mut conn),
        )
        .await?;
        if deleted == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn mark_session_inactive(&self, id: Uuid) -> Result<(), StoreError> {
        self.set_active(id, false, None).await
    }

    async fn reactivate_session(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.set_active(id, true, Some(at)).await
    }

    /// Cutoff compare and disable run as one script.
    async fn mark_idle_inactive(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.sweep_idle_script.key(ACTIVE_SET);
        invocation.arg(KEY_PREFIX).arg(cutoff.timestamp_millis());
        let marked: i64 = Self::bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(usize::try_from(marked).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;

    #[test]
    fn test_field_mapping() {
        let meta = conformance::sample();
        let fields: HashMap<String, String> = to_fields(&meta)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(fields["is_active"], "1");
        assert_eq!(from_fields(fields).unwrap(), meta);
    }

    #[test]
    fn test_missing_optional_fields() {
        let mut meta = conformance::sample();
        meta.client_ip = None;
        meta.user_agent = None;
        meta.is_active = false;
        let fields = to_fields(&meta)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(from_fields(fields).unwrap(), meta);
    }

    #[test]
    fn test_session_key_format() {
        let id = Uuid::nil();
        assert_eq!(
            session_key(id),
            "ssh_session:00000000-0000-0000-0000-000000000000"
        );
    }

    /// Runs only when a scratch Redis is provided.
    #[tokio::test]
    async fn test_redis_store_conformance() {
        let Ok(url) = std::env::var("SSH_RELAY_TEST_REDIS_URL") else {
            return;
        };
        let store = RedisSessionStore::connect(&url).await.unwrap();
        conformance::run(&store).await;
    }

    #[tokio::test]
    async fn test_idle_sweep_spares_touched_session() {
        let Ok(url) = std::env::var("SSH_RELAY_TEST_REDIS_URL") else {
            return;
        };
        let store = RedisSessionStore::connect(&url).await.unwrap();
        let cutoff = Utc::now() - chrono::Duration::hours(1);

        let mut stale = conformance::sample();
        stale.last_activity = cutoff - chrono::Duration::minutes(5);
        let mut revived = conformance::sample();
        revived.last_activity = stale.last_activity;
        store.create_session(&stale).await.unwrap();
        store.create_session(&revived).await.unwrap();
        store.update_session_activity(revived.id, Utc::now()).await.unwrap();

        assert!(store.mark_idle_inactive(cutoff).await.unwrap() >= 1);
        assert!(!store.get_session(stale.id).await.unwrap().is_active);
        assert!(store.get_session(revived.id).await.unwrap().is_active);

        let active: Vec<String> = store.conn.clone().smembers(ACTIVE_SET).await.unwrap();
        assert!(!active.contains(&stale.id.to_string()));
        assert!(active.contains(&revived.id.to_string()));

        store.remove_session(stale.id).await.unwrap();
        store.remove_session(revived.id).await.unwrap();
    }
}
