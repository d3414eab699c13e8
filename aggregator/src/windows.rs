//! Time-bucketed rings backing the rolling uptime and latency windows.
//!
//! Each ring covers its window at a fixed bucket resolution (144 ten-
//! minute buckets for 24 h; hourly buckets for 7 d and 30 d). Values are
//! exact to bucket resolution. Out-of-order arrivals land in whichever
//! bucket their timestamp belongs to; anything older than the window is
//! ignored.

use chrono::{DateTime, Utc};
use guardant_core::{RollupWindows, WindowStats};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
struct Bucket {
    /// Epoch index this slot currently holds; stale slots are recycled.
    epoch: i64,
    ok: u64,
    total: u64,
    rtt_sum_ms: f64,
    rtt_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketRing {
    bucket_seconds: i64,
    buckets: Vec<Bucket>,
}

impl BucketRing {
    pub fn new(bucket_seconds: i64, bucket_count: usize) -> Self {
        Self {
            bucket_seconds,
            buckets: vec![Bucket::default(); bucket_count],
        }
    }

    /// 24 h at 10-minute resolution.
    pub fn daily() -> Self {
        Self::new(600, 144)
    }

    /// 7 d at hourly resolution.
    pub fn weekly() -> Self {
        Self::new(3600, 168)
    }

    /// 30 d at hourly resolution.
    pub fn monthly() -> Self {
        Self::new(3600, 720)
    }

    fn window_seconds(&self) -> i64 {
        self.bucket_seconds * self.buckets.len() as i64
    }

    fn epoch_of(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp().div_euclid(self.bucket_seconds)
    }

    /// Record one observation at its own timestamp.
    pub fn record(&mut self, at: DateTime<Utc>, now: DateTime<Utc>, up: bool, rtt_ms: Option<f64>) {
        if (now - at).num_seconds() >= self.window_seconds() || at > now + chrono::Duration::seconds(self.bucket_seconds) {
            return;
        }
        let epoch = self.epoch_of(at);
        let len = self.buckets.len() as i64;
        let slot = &mut self.buckets[epoch.rem_euclid(len) as usize];
        if slot.epoch != epoch {
            *slot = Bucket {
                epoch,
                ..Bucket::default()
            };
        }
        slot.total += 1;
        if up {
            slot.ok += 1;
        }
        if let Some(rtt) = rtt_ms {
            slot.rtt_sum_ms += rtt;
            slot.rtt_count += 1;
        }
    }

    /// Aggregate over every bucket still inside the window.
    pub fn stats(&self, now: DateTime<Utc>) -> WindowStats {
        let newest = self.epoch_of(now);
        let oldest = newest - self.buckets.len() as i64 + 1;
        let mut ok = 0u64;
        let mut total = 0u64;
        let mut rtt_sum = 0.0;
        let mut rtt_count = 0u64;
        for bucket in &self.buckets {
            if bucket.epoch < oldest || bucket.epoch > newest || bucket.total == 0 {
                continue;
            }
            ok += bucket.ok;
            total += bucket.total;
            rtt_sum += bucket.rtt_sum_ms;
            rtt_count += bucket.rtt_count;
        }
        WindowStats {
            uptime_pct: if total == 0 {
                100.0
            } else {
                ok as f64 / total as f64 * 100.0
            },
            avg_rtt_ms: if rtt_count == 0 {
                None
            } else {
                Some(rtt_sum / rtt_count as f64)
            },
            samples: total,
        }
    }
}

/// The three standard windows kept per service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceWindows {
    pub h24: BucketRing,
    pub d7: BucketRing,
    pub d30: BucketRing,
}

impl Default for ServiceWindows {
    fn default() -> Self {
        Self {
            h24: BucketRing::daily(),
            d7: BucketRing::weekly(),
            d30: BucketRing::monthly(),
        }
    }
}

impl ServiceWindows {
    pub fn record(&mut self, at: DateTime<Utc>, now: DateTime<Utc>, up: bool, rtt_ms: Option<f64>) {
        self.h24.record(at, now, up, rtt_ms);
        self.d7.record(at, now, up, rtt_ms);
        self.d30.record(at, now, up, rtt_ms);
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> RollupWindows {
        RollupWindows {
            h24: self.h24.stats(now),
            d7: self.d7.stats(now),
            d30: self.d30.stats(now),
        }
    }
}
