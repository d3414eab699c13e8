use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::service::ServiceType;
use crate::task::ProbeTask;

/// Semantic outcome of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Up,
    Down,
    Degraded,
}

/// Failure classification carried across the wire. Recoverable causes stay
/// local to the component that raised them; only these kinds cross
/// component boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Tls,
    Dns,
    Protocol,
    ConnectionRefused,
    ConnectionReset,
    Decode,
    RedirectLoop,
    RateLimited,
    /// Injected by the dispatcher when a task exhausted its redelivery cap.
    Undeliverable,
    /// Injected by the dispatcher when no region had an eligible worker.
    NoCoverage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeFailure {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProbeFailure {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, detail: None }
    }

    pub fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }
}

/// Opportunistic observations captured alongside the semantic status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_expiry_days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_loss_pct: Option<f64>,
}

impl Sample {
    pub fn is_empty(&self) -> bool {
        self.body_hash.is_none() && self.tls_expiry_days.is_none() && self.packet_loss_pct.is_none()
    }
}

/// The record a worker emits for every executed probe. Aggregation is
/// idempotent on `result_id`; `(service_id, started_at, region)` is the
/// secondary identity used for latest-state selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub result_id: Uuid,
    pub task_id: Uuid,
    pub service_id: Uuid,
    pub nest_id: Uuid,
    pub worker_id: String,
    pub region: String,
    pub service_type: ServiceType,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtt_ms: Option<f64>,
    pub status: ProbeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProbeFailure>,
    #[serde(default, skip_serializing_if = "Sample::is_empty")]
    pub sample: Sample,
}

impl ProbeResult {
    /// Skeleton result for a task; strategies fill in outcome fields.
    pub fn for_task(task: &ProbeTask, worker_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            result_id: Uuid::new_v4(),
            task_id: task.task_id,
            service_id: task.service_id,
            nest_id: task.nest_id,
            worker_id: worker_id.into(),
            region: task.region.clone(),
            service_type: task.service_type,
            started_at,
            rtt_ms: None,
            status: ProbeStatus::Down,
            status_code: None,
            error: None,
            sample: Sample::default(),
        }
    }

    pub fn is_up(&self) -> bool {
        self.status == ProbeStatus::Up
    }
}
