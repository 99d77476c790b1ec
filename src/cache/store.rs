//! Key-value store boundary for cached responses.
//!
//! [`CacheStore`] is the only thing the cache layer knows about persistence.
//! [`MemoryStore`] keeps entries in-process; [`RedisStore`] (feature `redis`)
//! talks to a Redis server. Stores deal in opaque bytes; encoding lives in
//! [`CacheEntry`](super::CacheEntry).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

/// Errors surfaced by a [`CacheStore`] or by the guards around it.
///
/// The cache layer never propagates these to clients; they are logged and the
/// request falls through to the origin.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("cache entry codec error: {0}")]
    Codec(String),

    #[error("store operation cancelled")]
    Cancelled,

    #[error("store operation timed out")]
    Timeout,
}

impl StoreError {
    /// Short label used as a metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Backend(_) => "backend",
            StoreError::Codec(_) => "codec",
            StoreError::Cancelled => "cancelled",
            StoreError::Timeout => "timeout",
        }
    }
}

/// Pluggable key-value store.
///
/// Implementations must be safe to call concurrently. Expiry is the store's
/// responsibility: a value set with `ttl` must not be returned after `ttl`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct Slot {
    value: Bytes,
    expires_at: Instant,
}

/// In-process store backed by a sharded map.
///
/// Expiry runs on the tokio clock, so paused-time tests can step across a TTL.
/// Expired entries are dropped when read and by [`purge_expired`](Self::purge_expired).
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes every expired entry; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.expires_at > now);
        before.saturating_sub(self.slots.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.slots
            .get(key)
            .is_some_and(|slot| slot.expires_at > Instant::now())
    }

    pub fn keys(&self) -> Vec<String> {
        self.slots.iter().map(|slot| slot.key().clone()).collect()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let now = Instant::now();
        if let Some(slot) = self.slots.get(key) {
            if slot.expires_at > now {
                return Ok(Some(slot.value.clone()));
            }
        }
        // The read guard above must be released before removing.
        self.slots.remove_if(key, |_, slot| slot.expires_at <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Instant::now() + ttl;
        self.slots.insert(key.to_owned(), Slot { value, expires_at });
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.slots.remove(key);
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use self::redis_store::RedisStore;

#[cfg(feature = "redis")]
mod redis_store {
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use redis::{Client, aio::ConnectionManager};

    use super::{CacheStore, StoreError};

    impl From<redis::RedisError> for StoreError {
        fn from(e: redis::RedisError) -> Self {
            StoreError::Backend(e.to_string())
        }
    }

    /// Redis-backed store using a self-reconnecting connection manager.
    ///
    /// Entries are written with `SET key value PX ttl`, so expiry is enforced
    /// by the server.
    #[derive(Clone)]
    pub struct RedisStore {
        conn: ConnectionManager,
    }

    impl RedisStore {
        pub async fn connect(url: &str) -> Result<Self, StoreError> {
            let client = Client::open(url)?;
            let conn = ConnectionManager::new(client).await?;
            tracing::info!(url = %url, "connected to redis cache store");
            Ok(Self { conn })
        }
    }

    #[async_trait]
    impl CacheStore for RedisStore {
        async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
            let mut conn = self.conn.clone();
            let value: Option<Vec<u8>> = redis::cmd("GET")
                .arg(key)
                .query_async::<_, Option<Vec<u8>>>(&mut conn)
                .await?;
            Ok(value.map(Bytes::from))
        }

        async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
            let mut conn = self.conn.clone();
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            redis::cmd("SET")
                .arg(key)
                .arg(value.as_ref())
                .arg("PX")
                .arg(millis)
                .query_async::<_, ()>(&mut conn)
                .await?;
            Ok(())
        }

        async fn del(&self, key: &str) -> Result<(), StoreError> {
            let mut conn = self.conn.clone();
            redis::cmd("DEL")
                .arg(key)
                .query_async::<_, ()>(&mut conn)
                .await?;
            Ok(())
        }
    }
}
