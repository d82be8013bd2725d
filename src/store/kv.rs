// =============================================================================
// Key-value façade over Redis
// =============================================================================
//
// All persisted values are JSON. The trait keeps the command surface small
// (Get/Set/SetEx/Hget/Hset/Delete/Scan) so that the rest of the service
// never touches raw Redis commands, and so that tests can run against the
// in-memory implementation without a server.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ServiceError, ServiceResult};

// =============================================================================
// Trait
// =============================================================================

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> ServiceResult<Option<String>>;
    /// Set with an optional TTL; `None` stores without expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> ServiceResult<()>;
    async fn exists(&self, key: &str) -> ServiceResult<bool>;
    async fn del(&self, key: &str) -> ServiceResult<()>;
    async fn expire(&self, key: &str, ttl: Duration) -> ServiceResult<()>;

    async fn hget(&self, key: &str, field: &str) -> ServiceResult<Option<String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> ServiceResult<()>;
    /// Replace-many: write all entries in one round trip.
    async fn hset_many(&self, key: &str, entries: &[(String, String)]) -> ServiceResult<()>;
    async fn hgetall(&self, key: &str) -> ServiceResult<HashMap<String, String>>;
    async fn hdel(&self, key: &str, fields: &[String]) -> ServiceResult<()>;

    /// All keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> ServiceResult<Vec<String>>;
    async fn ping(&self) -> ServiceResult<()>;
}

// =============================================================================
// JSON helpers
// =============================================================================

pub async fn get_json<T: DeserializeOwned>(
    kv: &dyn KvStore,
    key: &str,
) -> ServiceResult<Option<T>> {
    match kv.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize>(
    kv: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> ServiceResult<()> {
    let raw = serde_json::to_string(value)?;
    kv.set(key, &raw, ttl).await
}

pub async fn hget_json<T: DeserializeOwned>(
    kv: &dyn KvStore,
    key: &str,
    field: &str,
) -> ServiceResult<Option<T>> {
    match kv.hget(key, field).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn hset_json<T: Serialize>(
    kv: &dyn KvStore,
    key: &str,
    field: &str,
    value: &T,
) -> ServiceResult<()> {
    let raw = serde_json::to_string(value)?;
    kv.hset(key, field, &raw).await
}

pub async fn hgetall_json<T: DeserializeOwned>(
    kv: &dyn KvStore,
    key: &str,
) -> ServiceResult<Vec<(String, T)>> {
    let raw = kv.hgetall(key).await?;
    let mut out = Vec::with_capacity(raw.len());
    for (field, value) in raw {
        // A single corrupt field must not poison the whole hash read.
        match serde_json::from_str(&value) {
            Ok(parsed) => out.push((field, parsed)),
            Err(e) => debug!(key, field, error = %e, "skipping undecodable hash field"),
        }
    }
    Ok(out)
}

// =============================================================================
// Redis implementation
// =============================================================================

/// Production store backed by a multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    /// Open a connection manager against `url`, bounded by
    /// `connect_timeout`.
    pub async fn connect(url: &str, connect_timeout: Duration) -> ServiceResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| ServiceError::ConfigInvalid(format!("redis url: {e}")))?;

        let manager = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| ServiceError::RedisUnavailable("connect timeout".into()))??;

        info!(url = %redacted(url), "redis connection established");
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

/// Strip any password from a Redis URL before logging it.
fn redacted(url: &str) -> String {
    match (url.find("//"), url.find('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}//***{}", &url[..scheme], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> ServiceResult<Option<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> ServiceResult<()> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("EX")
                    .arg(ttl.as_secs().max(1))
                    .query_async::<_, ()>(&mut conn)
                    .await?
            }
            None => {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .query_async::<_, ()>(&mut conn)
                    .await?
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> ServiceResult<bool> {
        let mut conn = self.conn();
        let n: u64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(n > 0)
    }

    async fn del(&self, key: &str) -> ServiceResult<()> {
        let mut conn = self.conn();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> ServiceResult<()> {
        let mut conn = self.conn();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> ServiceResult<Option<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> ServiceResult<()> {
        let mut conn = self.conn();
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn hset_many(&self, key: &str, entries: &[(String, String)]) -> ServiceResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in entries {
            cmd.arg(field).arg(value);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> ServiceResult<HashMap<String, String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?)
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> ServiceResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(key);
        for field in fields {
            cmd.arg(field);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> ServiceResult<Vec<String>> {
        let mut conn = self.conn();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn ping(&self) -> ServiceResult<()> {
        let mut conn = self.conn();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(ServiceError::RedisUnavailable(format!(
                "unexpected ping reply: {pong}"
            )))
        }
    }
}

// =============================================================================
// In-memory implementation (tests)
// =============================================================================

enum Slot {
    Value(String),
    Hash(HashMap<String, String>),
}

struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

/// In-memory store with logical TTL tracking. Used by the test suite; the
/// behaviour mirrors the Redis implementation for the command subset above.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str) {
        if entries.get(key).is_some_and(Entry::expired) {
            entries.remove(key);
        }
    }

    /// Test helper: the remaining TTL recorded for `key`.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|t| t.saturating_duration_since(Instant::now()))
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> ServiceResult<Option<String>> {
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries, key);
        match entries.get(key) {
            Some(Entry {
                slot: Slot::Value(v),
                ..
            }) => Ok(Some(v.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> ServiceResult<()> {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Value(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> ServiceResult<bool> {
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries, key);
        Ok(entries.contains_key(key))
    }

    async fn del(&self, key: &str) -> ServiceResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> ServiceResult<()> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> ServiceResult<Option<String>> {
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries, key);
        match entries.get(key) {
            Some(Entry {
                slot: Slot::Hash(h),
                ..
            }) => Ok(h.get(field).cloned()),
            _ => Ok(None),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> ServiceResult<()> {
        self.hset_many(key, &[(field.to_string(), value.to_string())])
            .await
    }

    async fn hset_many(&self, key: &str, pairs: &[(String, String)]) -> ServiceResult<()> {
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries, key);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.slot {
            Slot::Hash(h) => {
                for (field, value) in pairs {
                    h.insert(field.clone(), value.clone());
                }
                Ok(())
            }
            Slot::Value(_) => Err(ServiceError::Internal(format!(
                "WRONGTYPE: {key} holds a plain value"
            ))),
        }
    }

    async fn hgetall(&self, key: &str) -> ServiceResult<HashMap<String, String>> {
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries, key);
        match entries.get(key) {
            Some(Entry {
                slot: Slot::Hash(h),
                ..
            }) => Ok(h.clone()),
            _ => Ok(HashMap::new()),
        }
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> ServiceResult<()> {
        let mut entries = self.entries.lock();
        if let Some(Entry {
            slot: Slot::Hash(h),
            ..
        }) = entries.get_mut(key)
        {
            for field in fields {
                h.remove(field);
            }
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> ServiceResult<Vec<String>> {
        let mut entries = self.entries.lock();
        entries.retain(|_, e| !e.expired());
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> ServiceResult<()> {
        Ok(())
    }
}
