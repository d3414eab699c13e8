//! Durable long-term archive seam.
//!
//! The archive is an external content-addressed KV treated as opaque and
//! eventually consistent. Writes are buffered locally and forwarded by a
//! background reconciler; conflicts resolve by `(timestamp, version)`,
//! newer wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::StoreError;

#[async_trait]
pub trait Archive: Send + Sync {
    /// Store a value; returns an opaque handle.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<String, StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// Hint that cached entries should be flushed downstream.
    async fn sync(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveWrite {
    pub key: String,
    pub value: String,
    pub ttl_seconds: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
}

impl ArchiveWrite {
    fn supersedes(&self, other: &ArchiveWrite) -> bool {
        (self.timestamp, self.version) > (other.timestamp, other.version)
    }
}

/// Buffers archive writes and forwards them in the background with
/// exponential backoff. Pending writes for the same key collapse to the
/// newest `(timestamp, version)`.
pub struct ArchiveReconciler {
    archive: Arc<dyn Archive>,
    pending: Mutex<HashMap<String, ArchiveWrite>>,
    flush_interval: Duration,
}

impl ArchiveReconciler {
    pub fn new(archive: Arc<dyn Archive>) -> Self {
        Self {
            archive,
            pending: Mutex::new(HashMap::new()),
            flush_interval: Duration::from_secs(30),
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Enqueue a write; returns immediately. Older pending writes for the
    /// same key are discarded.
    pub async fn enqueue(&self, write: ArchiveWrite) {
        let mut pending = self.pending.lock().await;
        match pending.get(&write.key) {
            Some(existing) if existing.supersedes(&write) => {
                debug!(key = %write.key, "dropping stale archive write");
            }
            _ => {
                pending.insert(write.key.clone(), write);
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Attempt to forward every pending write once. Failed writes stay
    /// queued. Returns how many were flushed.
    pub async fn flush_once(&self) -> usize {
        let snapshot: Vec<ArchiveWrite> = {
            let pending = self.pending.lock().await;
            pending.values().cloned().collect()
        };
        let mut flushed = 0;
        for write in snapshot {
            let ttl = write.ttl_seconds.map(Duration::from_secs);
            match self.archive.put(&write.key, &write.value, ttl).await {
                Ok(_) => {
                    let mut pending = self.pending.lock().await;
                    // Only remove if a newer write has not replaced it.
                    if let Some(current) = pending.get(&write.key) {
                        if !current.supersedes(&write) {
                            pending.remove(&write.key);
                        }
                    }
                    flushed += 1;
                }
                Err(err) => {
                    warn!(key = %write.key, error = %err, "archive forward failed; will retry");
                }
            }
        }
        flushed
    }

    /// Background loop; doubles the delay after an empty-progress round,
    /// capped at ten intervals.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut delay = self.flush_interval;
        let cap = self.flush_interval * 10;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let had_pending = self.pending_count().await > 0;
            let flushed = self.flush_once().await;
            let _ = self.archive.sync().await;
            delay = if had_pending && flushed == 0 {
                (delay * 2).min(cap)
            } else {
                self.flush_interval
            };
        }
    }
}

/// In-memory archive used by tests and as the default when no external
/// archive is configured.
#[derive(Default)]
pub struct MemoryArchive {
    entries: Mutex<HashMap<String, String>>,
    fail_puts: std::sync::atomic::AtomicBool,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: make `put` fail until re-enabled.
    pub fn set_failing(&self, failing: bool) {
        self.fail_puts
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl Archive for MemoryArchive {
    async fn put(&self, key: &str, value: &str, _ttl: Option<Duration>) -> Result<String, StoreError> {
        if self.fail_puts.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Backend("archive unavailable".to_string()));
        }
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(format!("mem:{key}"))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn sync(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(key: &str, value: &str, version: u64) -> ArchiveWrite {
        ArchiveWrite {
            key: key.to_string(),
            value: value.to_string(),
            ttl_seconds: None,
            timestamp: Utc::now(),
            version,
        }
    }

    #[tokio::test]
    async fn newer_write_wins() {
        let archive = Arc::new(MemoryArchive::new());
        let reconciler = ArchiveReconciler::new(archive.clone());

        let older = write("k", "old", 1);
        let newer = ArchiveWrite {
            version: 2,
            value: "new".to_string(),
            ..older.clone()
        };
        reconciler.enqueue(newer).await;
        reconciler.enqueue(older).await;
        assert_eq!(reconciler.pending_count().await, 1);

        assert_eq!(reconciler.flush_once().await, 1);
        assert_eq!(archive.get("k").await.unwrap(), Some("new".to_string()));
        assert_eq!(reconciler.pending_count().await, 0);
    }

    #[tokio::test]
    async fn failed_forward_stays_queued() {
        let archive = Arc::new(MemoryArchive::new());
        archive.set_failing(true);
        let reconciler = ArchiveReconciler::new(archive.clone());
        reconciler.enqueue(write("k", "v", 1)).await;

        assert_eq!(reconciler.flush_once().await, 0);
        assert_eq!(reconciler.pending_count().await, 1);

        archive.set_failing(false);
        assert_eq!(reconciler.flush_once().await, 1);
        assert_eq!(archive.get("k").await.unwrap(), Some("v".to_string()));
    }
}
