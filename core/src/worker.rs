use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::region::GeoPoint;
use crate::service::ServiceType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerLocation {
    pub city: String,
    pub country: String,
    pub continent: String,
    pub coordinates: GeoPoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerFeatures {
    pub icmp: bool,
    pub ipv6: bool,
    pub custom_headers: bool,
    pub tls_verify: bool,
    /// Sustained bandwidth the operator grants probing, in Mbit/s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_mbps: Option<u32>,
}

impl Default for WorkerFeatures {
    fn default() -> Self {
        Self {
            icmp: false,
            ipv6: false,
            custom_headers: true,
            tls_verify: true,
            bandwidth_mbps: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerLimits {
    pub max_concurrency: usize,
    pub rpm: u32,
    pub max_response_mb: u32,
    pub timeout_seconds: u32,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            rpm: 300,
            max_response_mb: 5,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub service_types: Vec<ServiceType>,
    #[serde(default)]
    pub features: WorkerFeatures,
    #[serde(default)]
    pub limits: WorkerLimits,
}

impl WorkerCapabilities {
    pub fn supports(&self, service_type: ServiceType) -> bool {
        if service_type == ServiceType::Ping && !self.features.icmp {
            return false;
        }
        self.service_types.contains(&service_type)
    }
}

impl Default for WorkerCapabilities {
    fn default() -> Self {
        Self {
            service_types: vec![
                ServiceType::Web,
                ServiceType::Keyword,
                ServiceType::Tcp,
                ServiceType::Port,
                ServiceType::Github,
                ServiceType::UptimeApi,
            ],
            features: WorkerFeatures::default(),
            limits: WorkerLimits::default(),
        }
    }
}

/// Broker credentials issued on approval; scoped to the worker's own
/// command queue and its region's task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerCredentials {
    pub username: String,
    pub password: String,
    pub amqp_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub approved: bool,
    pub suspended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<BrokerCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerCounters {
    pub checks_ok: u64,
    pub checks_fail: u64,
    pub total_points: f64,
    pub current_period_points: f64,
    pub avg_rt_ms: f64,
}

/// Registry record for one worker process. Lifecycle:
/// pending -> approved -> (active | suspended) -> deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub owner_email: String,
    pub location: WorkerLocation,
    pub capabilities: WorkerCapabilities,
    #[serde(default)]
    pub status: WorkerStatus,
    #[serde(default)]
    pub counters: WorkerCounters,
    pub registered_at: DateTime<Utc>,
}

impl WorkerRegistration {
    /// Eligible to consume tasks of the given type right now.
    pub fn eligible_for(&self, service_type: ServiceType) -> bool {
        self.status.approved && !self.status.suspended && self.capabilities.supports(service_type)
    }
}

/// Periodic liveness record written to the heartbeat KV (TTL 90 s per
/// entry). Last-writer-wins; the worker is the authority for its counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: String,
    pub version: String,
    pub region: String,
    pub last_seen: DateTime<Utc>,
    pub checks_ok: u64,
    pub checks_fail: u64,
    pub total_points: f64,
    pub current_period_points: f64,
    pub avg_rt_ms: f64,
    pub buffer_depth: usize,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_error: Option<String>,
}

/// Liveness thresholds. A worker missing heartbeats for over
/// [`ACTIVE_WINDOW_SECONDS`] is not offered tasks; entries expire from the
/// KV entirely at [`HEARTBEAT_TTL_SECONDS`].
pub const ACTIVE_WINDOW_SECONDS: i64 = 60;
pub const HEARTBEAT_TTL_SECONDS: u64 = 90;

impl Heartbeat {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_seen).num_seconds() < ACTIVE_WINDOW_SECONDS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn ping_requires_icmp_feature() {
        let mut caps = WorkerCapabilities::default();
        caps.service_types.push(ServiceType::Ping);
        assert!(!caps.supports(ServiceType::Ping));
        caps.features.icmp = true;
        assert!(caps.supports(ServiceType::Ping));
    }

    #[test]
    fn eligibility_gates_on_approval_and_suspension() {
        let mut reg = WorkerRegistration {
            worker_id: "w-1".into(),
            owner_email: "ops@example.com".into(),
            location: WorkerLocation {
                city: "Frankfurt".into(),
                country: "DE".into(),
                continent: "Europe".into(),
                coordinates: GeoPoint::new(50.1, 8.7),
                asn: None,
                isp: None,
            },
            capabilities: WorkerCapabilities::default(),
            status: WorkerStatus::default(),
            counters: WorkerCounters::default(),
            registered_at: Utc::now(),
        };
        assert!(!reg.eligible_for(ServiceType::Web));
        reg.status.approved = true;
        assert!(reg.eligible_for(ServiceType::Web));
        reg.status.suspended = true;
        assert!(!reg.eligible_for(ServiceType::Web));
    }

    #[test]
    fn heartbeat_liveness_window() {
        let now = Utc::now();
        let hb = Heartbeat {
            worker_id: "w-1".into(),
            version: "1.0.0".into(),
            region: "eu-central-1".into(),
            last_seen: now - Duration::seconds(59),
            checks_ok: 0,
            checks_fail: 0,
            total_points: 0.0,
            current_period_points: 0.0,
            avg_rt_ms: 0.0,
            buffer_depth: 0,
            connected: true,
            last_update_error: None,
        };
        assert!(hb.is_active(now));
        let stale = Heartbeat {
            last_seen: now - Duration::seconds(61),
            ..hb
        };
        assert!(!stale.is_active(now));
    }
}
