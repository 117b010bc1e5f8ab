//! Key-value collaborator with per-key TTL
//!
//! The manager only needs `get` and `set_with_ttl`; windows are stored as
//! JSON strings under `{instrument}:{interval}`.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::time::Instant;
use tracing::info;

use crate::error::CacheError;

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Value for `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value`, replacing any previous value and resetting the TTL.
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
}

/// Process-local store.
///
/// Expiry is checked on read against the tokio clock, so paused-time tests
/// can advance past a TTL.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, including expired ones not yet read.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        let value = match self.entries.get(key) {
            Some(entry) if entry.1 > now => return Ok(Some(entry.0.clone())),
            Some(_) => None,
            None => return Ok(None),
        };
        self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }
}

/// Redis `GET` / `SET EX` store.
#[derive(Clone)]
pub struct RedisStore {
    con: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let con = client.get_connection_manager().await?;
        info!("Connected to Redis cache store");
        Ok(Self { con })
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut con = self.con.clone();
        let value: Option<String> = con.get(key).await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut con = self.con.clone();
        let seconds = ttl.as_secs().max(1);
        let _: () = con.set_ex(key, value, seconds).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_expires() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("BTCUSDT:1m", "[]".to_string(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("BTCUSDT:1m").await.unwrap().as_deref(), Some("[]"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.get("BTCUSDT:1m").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_refreshes_ttl() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);
        store.set_with_ttl("k", "a".to_string(), ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        store.set_with_ttl("k", "b".to_string(), ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_missing_key() {
        let store = MemoryStore::new();
        assert!(store.get("nope").await.unwrap().is_none());
    }
}
