use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::result::{ProbeStatus, Sample};

/// Latest observed state for one region of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionState {
    pub result_id: Uuid,
    pub status: ProbeStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtt_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Sample::is_empty")]
    pub sample: Sample,
}

/// Exact-to-bucket-resolution aggregate over one rolling window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub uptime_pct: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_rtt_ms: Option<f64>,
    pub samples: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RollupWindows {
    pub h24: WindowStats,
    pub d7: WindowStats,
    pub d30: WindowStats,
}

/// Authoritative per-service aggregation for status pages. Serialized
/// snapshot of the aggregator's in-memory state; cached under
/// `rollup:<nest>:<service>` with a 24 h TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRollup {
    pub service_id: Uuid,
    pub nest_id: Uuid,
    pub current_status: ProbeStatus,
    pub last_transition: DateTime<Utc>,
    pub regions: BTreeMap<String, RegionState>,
    pub windows: RollupWindows,
    pub updated_at: DateTime<Utc>,
}

impl ServiceRollup {
    pub fn latest_check(&self) -> Option<DateTime<Utc>> {
        self.regions.values().map(|r| r.started_at).max()
    }

    /// Latest round-trip over regions currently reporting one.
    pub fn current_rtt_ms(&self) -> Option<f64> {
        let rtts: Vec<f64> = self.regions.values().filter_map(|r| r.rtt_ms).collect();
        if rtts.is_empty() {
            None
        } else {
            Some(rtts.iter().sum::<f64>() / rtts.len() as f64)
        }
    }
}
