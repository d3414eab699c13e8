use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::service::{Service, ServiceType, TypeConfig};

/// One unit of probing work, published to the task exchange keyed by
/// region. Consumed by exactly one worker, at-least-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeTask {
    pub task_id: Uuid,
    pub nest_id: Uuid,
    pub service_id: Uuid,
    pub service_type: ServiceType,
    pub target: String,
    pub type_config: TypeConfig,
    pub interval_seconds: u32,
    pub timeout_ms: u32,
    pub region: String,
    /// 1 (highest) .. 10 (lowest); derived from the nest's tier.
    pub priority: u8,
    pub not_before: DateTime<Utc>,
    pub attempt: u32,
}

/// Published by the aggregator after it consumes a result, so the
/// dispatcher can clear in-flight tracking without competing on the
/// result queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSeen {
    pub task_id: Uuid,
    pub service_id: Uuid,
    pub region: String,
}

impl ProbeTask {
    pub fn for_service(service: &Service, region: impl Into<String>, priority: u8, now: DateTime<Utc>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            nest_id: service.nest_id,
            service_id: service.id,
            service_type: service.service_type,
            target: service.target.clone(),
            type_config: service.type_config.clone(),
            interval_seconds: service.interval_seconds,
            timeout_ms: service.timeout_ms,
            region: region.into(),
            priority,
            not_before: now,
            attempt: 0,
        }
    }

    /// Suppression key: one in-flight task per (service, region).
    pub fn flight_key(&self) -> (Uuid, String) {
        (self.service_id, self.region.clone())
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn synthetic_template() -> Self {
        Self {
            task_id: Uuid::new_v4(),
            nest_id: Uuid::new_v4(),
            service_id: Uuid::new_v4(),
            service_type: ServiceType::Web,
            target: "https://example.com".to_string(),
            type_config: TypeConfig::Web(crate::service::WebConfig::default()),
            interval_seconds: 60,
            timeout_ms: 5000,
            region: "eu-central-1".to_string(),
            priority: 10,
            not_before: Utc::now(),
            attempt: 0,
        }
    }
}
