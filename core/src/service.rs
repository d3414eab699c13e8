use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::nest::is_dns_safe_subdomain;

pub const MIN_INTERVAL_SECONDS: u32 = 30;
pub const MAX_INTERVAL_SECONDS: u32 = 3600;
pub const MAX_TIMEOUT_MS: u32 = 30_000;

/// The probe strategy a service is checked with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    Web,
    Tcp,
    Ping,
    Port,
    Keyword,
    Heartbeat,
    Github,
    UptimeApi,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Web => "web",
            ServiceType::Tcp => "tcp",
            ServiceType::Ping => "ping",
            ServiceType::Port => "port",
            ServiceType::Keyword => "keyword",
            ServiceType::Heartbeat => "heartbeat",
            ServiceType::Github => "github",
            ServiceType::UptimeApi => "uptime-api",
        }
    }

    /// Heartbeat services are evaluated against the ingest store rather
    /// than dispatched to the worker fleet.
    pub fn is_passive(&self) -> bool {
        matches!(self, ServiceType::Heartbeat)
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-type probe configuration. Tagged by the same wire name as
/// [`ServiceType`]; unknown variants are rejected at the API boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TypeConfig {
    Web(WebConfig),
    Keyword(KeywordConfig),
    Tcp(TcpConfig),
    Port(PortConfig),
    Ping(PingConfig),
    Heartbeat(HeartbeatConfig),
    Github(GithubConfig),
    UptimeApi(UptimeApiConfig),
}

impl TypeConfig {
    pub fn service_type(&self) -> ServiceType {
        match self {
            TypeConfig::Web(_) => ServiceType::Web,
            TypeConfig::Keyword(_) => ServiceType::Keyword,
            TypeConfig::Tcp(_) => ServiceType::Tcp,
            TypeConfig::Port(_) => ServiceType::Port,
            TypeConfig::Ping(_) => ServiceType::Ping,
            TypeConfig::Heartbeat(_) => ServiceType::Heartbeat,
            TypeConfig::Github(_) => ServiceType::Github,
            TypeConfig::UptimeApi(_) => ServiceType::UptimeApi,
        }
    }

    pub fn default_for(service_type: ServiceType) -> Self {
        match service_type {
            ServiceType::Web => TypeConfig::Web(WebConfig::default()),
            ServiceType::Keyword => TypeConfig::Keyword(KeywordConfig::default()),
            ServiceType::Tcp => TypeConfig::Tcp(TcpConfig::default()),
            ServiceType::Port => TypeConfig::Port(PortConfig::default()),
            ServiceType::Ping => TypeConfig::Ping(PingConfig::default()),
            ServiceType::Heartbeat => TypeConfig::Heartbeat(HeartbeatConfig::default()),
            ServiceType::Github => TypeConfig::Github(GithubConfig::default()),
            ServiceType::UptimeApi => TypeConfig::UptimeApi(UptimeApiConfig::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Exact status expected; `None` accepts any 2xx.
    #[serde(default)]
    pub expected_status: Option<u16>,
    #[serde(default = "default_true")]
    pub follow_redirects: bool,
    #[serde(default = "default_true")]
    pub tls_verify: bool,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            headers: BTreeMap::new(),
            expected_status: None,
            follow_redirects: true,
            tls_verify: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordConfig {
    #[serde(flatten)]
    pub web: WebConfig,
    pub expected_body_substring: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Bytes written after connect, if any.
    #[serde(default)]
    pub probe_bytes: Option<String>,
    /// Prefix the first read must start with.
    #[serde(default)]
    pub expected_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortConfig {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingConfig {
    #[serde(default = "default_ping_count")]
    pub count: u8,
    #[serde(default = "default_ping_size")]
    pub packet_size: u16,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            count: default_ping_count(),
            packet_size: default_ping_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub expected_interval_seconds: u32,
    #[serde(default = "default_grace")]
    pub grace_seconds: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            expected_interval_seconds: 60,
            grace_seconds: default_grace(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GithubConfig {
    pub owner: String,
    pub repo: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UptimeApiConfig {
    /// Dotted-path predicate evaluated against the JSON body,
    /// e.g. `status == "ok"` or `data.up == true`.
    pub predicate: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ping_count() -> u8 {
    4
}

fn default_ping_size() -> u16 {
    32
}

fn default_grace() -> u32 {
    60
}

/// How target regions are chosen for a service each dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionStrategy {
    /// Probe every user-selected region that has coverage.
    #[default]
    All,
    /// Up to `min_regions` regions nearest the service's estimated location.
    Closest,
    /// Rotate through the preferred regions one per cycle.
    RoundRobin,
    /// Primary region plus one backup.
    Failover,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPolicy {
    #[serde(default)]
    pub strategy: RegionStrategy,
    #[serde(default = "default_min_regions")]
    pub min_regions: usize,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            strategy: RegionStrategy::All,
            min_regions: default_min_regions(),
        }
    }
}

fn default_min_regions() -> usize {
    1
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceValidationError {
    #[error("interval {0}s outside [{MIN_INTERVAL_SECONDS}, {MAX_INTERVAL_SECONDS}]")]
    IntervalOutOfRange(u32),
    #[error("timeout {0}ms exceeds {MAX_TIMEOUT_MS}ms")]
    TimeoutTooLarge(u32),
    #[error("timeout {timeout_ms}ms exceeds interval {interval_seconds}s")]
    TimeoutExceedsInterval { timeout_ms: u32, interval_seconds: u32 },
    #[error("service name is empty")]
    EmptyName,
    #[error("target is empty")]
    EmptyTarget,
    #[error("no regions selected")]
    NoRegions,
    #[error("type config tagged {config} does not match service type {service}")]
    TypeConfigMismatch { service: String, config: String },
    #[error("subdomain is not a valid DNS label: {0}")]
    InvalidSubdomain(String),
}

/// A monitored endpoint owned by a nest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub nest_id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub target: String,
    pub type_config: TypeConfig,
    pub interval_seconds: u32,
    pub timeout_ms: u32,
    pub regions: Vec<String>,
    #[serde(default)]
    pub routing: RoutingPolicy,
    pub is_active: bool,
}

impl Service {
    pub fn validate(&self) -> Result<(), ServiceValidationError> {
        if self.name.trim().is_empty() {
            return Err(ServiceValidationError::EmptyName);
        }
        if self.target.trim().is_empty() && !self.service_type.is_passive() {
            return Err(ServiceValidationError::EmptyTarget);
        }
        if !(MIN_INTERVAL_SECONDS..=MAX_INTERVAL_SECONDS).contains(&self.interval_seconds) {
            return Err(ServiceValidationError::IntervalOutOfRange(
                self.interval_seconds,
            ));
        }
        if self.timeout_ms > MAX_TIMEOUT_MS {
            return Err(ServiceValidationError::TimeoutTooLarge(self.timeout_ms));
        }
        if self.timeout_ms > self.interval_seconds.saturating_mul(1000) {
            return Err(ServiceValidationError::TimeoutExceedsInterval {
                timeout_ms: self.timeout_ms,
                interval_seconds: self.interval_seconds,
            });
        }
        if self.regions.is_empty() {
            return Err(ServiceValidationError::NoRegions);
        }
        if self.type_config.service_type() != self.service_type {
            return Err(ServiceValidationError::TypeConfigMismatch {
                service: self.service_type.to_string(),
                config: self.type_config.service_type().to_string(),
            });
        }
        Ok(())
    }
}

/// Validate a subdomain outside of `Service` context (nest creation path).
pub fn validate_subdomain(subdomain: &str) -> Result<(), ServiceValidationError> {
    if is_dns_safe_subdomain(subdomain) {
        Ok(())
    } else {
        Err(ServiceValidationError::InvalidSubdomain(
            subdomain.to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web_service() -> Service {
        Service {
            id: Uuid::new_v4(),
            nest_id: Uuid::new_v4(),
            name: "homepage".into(),
            service_type: ServiceType::Web,
            target: "https://example.com".into(),
            type_config: TypeConfig::Web(WebConfig::default()),
            interval_seconds: 60,
            timeout_ms: 5000,
            regions: vec!["eu-central-1".into()],
            routing: RoutingPolicy::default(),
            is_active: true,
        }
    }

    #[test]
    fn valid_service_passes() {
        assert_eq!(web_service().validate(), Ok(()));
    }

    #[test]
    fn interval_bounds_enforced() {
        let mut svc = web_service();
        svc.interval_seconds = 29;
        assert!(matches!(
            svc.validate(),
            Err(ServiceValidationError::IntervalOutOfRange(29))
        ));
        svc.interval_seconds = 3601;
        assert!(svc.validate().is_err());
    }

    #[test]
    fn timeout_must_fit_interval() {
        let mut svc = web_service();
        svc.timeout_ms = 30_001;
        assert!(matches!(
            svc.validate(),
            Err(ServiceValidationError::TimeoutTooLarge(_))
        ));
        svc.timeout_ms = 30_000;
        svc.interval_seconds = MIN_INTERVAL_SECONDS;
        // 30s interval fits a 30s timeout exactly
        assert_eq!(svc.validate(), Ok(()));
    }

    #[test]
    fn config_tag_must_match_type() {
        let mut svc = web_service();
        svc.type_config = TypeConfig::Tcp(TcpConfig::default());
        assert!(matches!(
            svc.validate(),
            Err(ServiceValidationError::TypeConfigMismatch { .. })
        ));
    }

    #[test]
    fn service_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&ServiceType::UptimeApi).unwrap(),
            "\"uptime-api\""
        );
        assert_eq!(
            serde_json::from_str::<ServiceType>("\"heartbeat\"").unwrap(),
            ServiceType::Heartbeat
        );
    }

    #[test]
    fn type_config_round_trip() {
        let config = TypeConfig::Keyword(KeywordConfig {
            web: WebConfig::default(),
            expected_body_substring: "ok".into(),
        });
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"type\":\"keyword\""));
        let back: TypeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
