//! Hash-map store with real TTL and pub/sub semantics, for tests and
//! single-process deployments.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};

use crate::{ScanPage, StoreError, Subscription, TenantStore};

struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

#[derive(Default)]
struct Inner {
    kv: HashMap<String, Entry>,
    zsets: HashMap<String, Vec<(f64, String)>>,
    subscribers: Vec<(String, mpsc::UnboundedSender<(String, String)>)>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(pattern: &str, channel: &str) -> bool {
        match pattern.split_once('*') {
            Some((prefix, suffix)) => {
                channel.len() >= prefix.len() + suffix.len()
                    && channel.starts_with(prefix)
                    && channel.ends_with(suffix)
            }
            None => pattern == channel,
        }
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        match inner.kv.get(key) {
            Some(entry) if entry.live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                inner.kv.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut inner = self.inner.lock().await;
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.kv.remove(key);
        inner.zsets.remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str, cursor: u64, count: usize) -> Result<ScanPage, StoreError> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        let mut keys: Vec<String> = inner
            .kv
            .iter()
            .filter(|(k, entry)| k.starts_with(prefix) && entry.live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        let start = cursor as usize;
        let end = (start + count).min(keys.len());
        let page = keys[start.min(keys.len())..end].to_vec();
        let next = if end >= keys.len() { 0 } else { end as u64 };
        Ok((next, page))
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64, StoreError> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .kv
            .get(key)
            .and_then(|entry| entry.value.parse::<f64>().ok())
            .unwrap_or(0.0);
        let next = current + delta;
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let set = inner.zsets.entry(key.to_string()).or_default();
        set.retain(|(_, m)| m != member);
        set.push((score, member.to_string()));
        set.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(set) = inner.zsets.get_mut(key) {
            set.retain(|(_, m)| m != member);
        }
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .zsets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(score, _)| *score >= min && *score <= max)
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.subscribers.retain(|(pattern, tx)| {
            if Self::matches(pattern, channel) {
                tx.send((channel.to_string(), payload.to_string())).is_ok()
            } else {
                !tx.is_closed()
            }
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        inner.subscribers.push((pattern.to_string(), tx));
        Ok(Subscription::new(rx))
    }
}
