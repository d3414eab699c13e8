//! Tenant store adapter.
//!
//! The rest of the system assumes a small KV surface: get/set with
//! per-key TTL, cursor-based prefix scans (never a full keyspace dump),
//! float counters, sorted sets, and pub/sub for SSE fan-out. The
//! [`TenantStore`] trait captures exactly that; [`memory::MemoryStore`]
//! backs tests and [`redis_store::RedisStore`] production. The optional
//! durable archive sits behind [`archive::Archive`] with a background
//! reconciler treating it as eventually consistent.

pub mod archive;
pub mod keys;
pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("value decoding failed: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("concurrent update conflict on {0}")]
    Conflict(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// A pub/sub subscription; messages are `(channel, payload)`.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<(String, String)>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<(String, String)>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<(String, String)> {
        self.rx.recv().await
    }
}

/// Scan page: next cursor (0 when exhausted) plus matching keys.
pub type ScanPage = (u64, Vec<String>);

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Cursor-based prefix scan. Callers loop until the returned cursor
    /// is zero.
    async fn scan(&self, prefix: &str, cursor: u64, count: usize) -> Result<ScanPage, StoreError>;

    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64, StoreError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64)
        -> Result<Vec<String>, StoreError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;
    /// `pattern` supports a trailing `*` wildcard.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, StoreError>;
}

/// Fetch and decode a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn TenantStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode and store a JSON value.
pub async fn set_json<T: Serialize>(
    store: &dyn TenantStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    store.set(key, &serde_json::to_string(value)?).await
}

/// Encode and store a JSON value with a TTL.
pub async fn set_json_ttl<T: Serialize>(
    store: &dyn TenantStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), StoreError> {
    store.set_ttl(key, &serde_json::to_string(value)?, ttl).await
}

/// Collect every key under a prefix by walking the cursor.
pub async fn scan_all(store: &dyn TenantStore, prefix: &str) -> Result<Vec<String>, StoreError> {
    let mut keys = Vec::new();
    let mut cursor = 0;
    loop {
        let (next, page) = store.scan(prefix, cursor, 100).await?;
        keys.extend(page);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    Ok(keys)
}
