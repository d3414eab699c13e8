//! Probe engine.
//!
//! A pure-ish function of `(task, now) -> ProbeResult`: one strategy per
//! service type, a shared deadline covering DNS, connect and read, and a
//! distinct error kind per failure class. The engine never retries and
//! never panics on probe failure; retry policy belongs to the scheduler,
//! and failures are ordinary results.

mod http;
mod ping;
mod predicate;
mod tcp;
mod tls;

pub use ping::summarise_pings;
pub use predicate::{evaluate_predicate, PredicateError};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use guardant_core::{
    ErrorKind, ProbeFailure, ProbeResult, ProbeStatus, ProbeTask, TypeConfig,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProbeEngineError {
    #[error("http client construction failed: {0}")]
    ClientBuild(#[from] reqwest::Error),
}

/// Read side of the heartbeat ingest store. Heartbeat services are
/// passive: external systems push a beat, and the strategy only compares
/// the last beat against the expected cadence.
#[async_trait]
pub trait HeartbeatSource: Send + Sync {
    async fn last_heartbeat(
        &self,
        nest_id: Uuid,
        service_id: Uuid,
    ) -> Option<chrono::DateTime<chrono::Utc>>;
}

/// Degraded threshold: a matching response slower than half the probe
/// interval is degraded rather than up.
pub(crate) fn degraded_threshold_ms(interval_seconds: u32) -> f64 {
    interval_seconds as f64 * 1000.0 * 0.5
}

pub struct ProbeEngine {
    worker_id: String,
    clients: http::ClientSet,
    heartbeat_source: Option<Arc<dyn HeartbeatSource>>,
    github_api_base: String,
}

impl ProbeEngine {
    pub fn new(worker_id: impl Into<String>) -> Result<Self, ProbeEngineError> {
        Ok(Self {
            worker_id: worker_id.into(),
            clients: http::ClientSet::build()?,
            heartbeat_source: None,
            github_api_base: "https://api.github.com".to_string(),
        })
    }

    pub fn with_heartbeat_source(mut self, source: Arc<dyn HeartbeatSource>) -> Self {
        self.heartbeat_source = Some(source);
        self
    }

    /// Test hook pointing the github strategy at a stub server.
    pub fn with_github_api_base(mut self, base: impl Into<String>) -> Self {
        self.github_api_base = base.into();
        self
    }

    /// Execute one probe. The whole strategy runs under the task's
    /// deadline; overruns become `down` with kind `timeout`.
    pub async fn execute(&self, task: &ProbeTask) -> ProbeResult {
        let started_at = Utc::now();
        let deadline = Duration::from_millis(task.timeout_ms as u64);
        let mut result = ProbeResult::for_task(task, self.worker_id.clone(), started_at);

        let outcome = tokio::time::timeout(deadline, self.dispatch(task, deadline)).await;
        match outcome {
            Ok(outcome) => outcome.apply(&mut result),
            Err(_) => {
                result.status = ProbeStatus::Down;
                result.rtt_ms = Some(task.timeout_ms as f64);
                result.error = Some(ProbeFailure::new(ErrorKind::Timeout));
            }
        }
        result
    }

    async fn dispatch(&self, task: &ProbeTask, deadline: Duration) -> Outcome {
        match &task.type_config {
            TypeConfig::Web(config) => {
                http::probe_web(&self.clients, task, config, None, deadline).await
            }
            TypeConfig::Keyword(config) => {
                http::probe_web(
                    &self.clients,
                    task,
                    &config.web,
                    Some(&config.expected_body_substring),
                    deadline,
                )
                .await
            }
            TypeConfig::Tcp(config) => tcp::probe_tcp(task, config, deadline).await,
            TypeConfig::Port(_) => tcp::probe_port(task, deadline).await,
            TypeConfig::Ping(config) => ping::probe_ping(task, config, deadline).await,
            TypeConfig::Github(config) => {
                http::probe_github(&self.clients, &self.github_api_base, config, deadline).await
            }
            TypeConfig::UptimeApi(config) => {
                http::probe_uptime_api(&self.clients, task, config, deadline).await
            }
            TypeConfig::Heartbeat(config) => {
                let last = match &self.heartbeat_source {
                    Some(source) => source.last_heartbeat(task.nest_id, task.service_id).await,
                    None => None,
                };
                let window = Duration::from_secs(
                    (config.expected_interval_seconds + config.grace_seconds) as u64,
                );
                match last {
                    Some(at) if Utc::now() - at <= chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero()) => {
                        Outcome::up(None)
                    }
                    Some(at) => Outcome::down(ProbeFailure::with_detail(
                        ErrorKind::Timeout,
                        format!("last heartbeat at {at}"),
                    )),
                    None => Outcome::down(ProbeFailure::with_detail(
                        ErrorKind::Timeout,
                        "no heartbeat received",
                    )),
                }
            }
        }
    }
}

/// Strategy outcome folded into the result skeleton.
pub(crate) struct Outcome {
    pub status: ProbeStatus,
    pub rtt_ms: Option<f64>,
    pub status_code: Option<u16>,
    pub error: Option<ProbeFailure>,
    pub sample: guardant_core::Sample,
}

impl Outcome {
    pub fn up(rtt_ms: Option<f64>) -> Self {
        Self {
            status: ProbeStatus::Up,
            rtt_ms,
            status_code: None,
            error: None,
            sample: guardant_core::Sample::default(),
        }
    }

    pub fn down(error: ProbeFailure) -> Self {
        Self {
            status: ProbeStatus::Down,
            rtt_ms: None,
            status_code: None,
            error: Some(error),
            sample: guardant_core::Sample::default(),
        }
    }

    pub fn degraded(rtt_ms: Option<f64>, error: Option<ProbeFailure>) -> Self {
        Self {
            status: ProbeStatus::Degraded,
            rtt_ms,
            status_code: None,
            error,
            sample: guardant_core::Sample::default(),
        }
    }

    fn apply(self, result: &mut ProbeResult) {
        result.status = self.status;
        result.rtt_ms = self.rtt_ms;
        result.status_code = self.status_code;
        result.error = self.error;
        result.sample = self.sample;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardant_core::{HeartbeatConfig, ServiceType};

    struct FixedSource(Option<chrono::DateTime<chrono::Utc>>);

    #[async_trait]
    impl HeartbeatSource for FixedSource {
        async fn last_heartbeat(
            &self,
            _nest_id: Uuid,
            _service_id: Uuid,
        ) -> Option<chrono::DateTime<chrono::Utc>> {
            self.0
        }
    }

    fn heartbeat_task(expected: u32, grace: u32) -> ProbeTask {
        let mut task = ProbeTask::synthetic_template();
        task.service_type = ServiceType::Heartbeat;
        task.type_config = TypeConfig::Heartbeat(HeartbeatConfig {
            expected_interval_seconds: expected,
            grace_seconds: grace,
        });
        task
    }

    #[tokio::test]
    async fn heartbeat_up_within_window() {
        let source = Arc::new(FixedSource(Some(Utc::now() - chrono::Duration::seconds(30))));
        let engine = ProbeEngine::new("w-test")
            .unwrap()
            .with_heartbeat_source(source);
        let result = engine.execute(&heartbeat_task(60, 60)).await;
        assert_eq!(result.status, ProbeStatus::Up);
    }

    #[tokio::test]
    async fn heartbeat_down_past_grace() {
        let source = Arc::new(FixedSource(Some(
            Utc::now() - chrono::Duration::seconds(200),
        )));
        let engine = ProbeEngine::new("w-test")
            .unwrap()
            .with_heartbeat_source(source);
        let result = engine.execute(&heartbeat_task(60, 60)).await;
        assert_eq!(result.status, ProbeStatus::Down);
        assert_eq!(result.error.unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn heartbeat_down_when_never_seen() {
        let engine = ProbeEngine::new("w-test").unwrap();
        let result = engine.execute(&heartbeat_task(60, 0)).await;
        assert_eq!(result.status, ProbeStatus::Down);
    }
}
