//! HTTP-family strategies: web, keyword, github, uptime-api.

use std::time::{Duration, Instant};

use guardant_core::{
    ErrorKind, GithubConfig, ProbeFailure, ProbeStatus, ProbeTask, Sample, UptimeApiConfig,
    WebConfig,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::{Client, Method, Response, StatusCode};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::predicate::evaluate_predicate;
use crate::tls;
use crate::{degraded_threshold_ms, Outcome, ProbeEngineError};

const USER_AGENT: &str = concat!("guardant-probe/", env!("CARGO_PKG_VERSION"));
const MAX_REDIRECT_HOPS: usize = 10;
/// Keyword matching inspects at most this much of the body.
const KEYWORD_SCAN_LIMIT: usize = 1024 * 1024;
/// Certificates expiring sooner than this are sampled onto results.
const TLS_EXPIRY_SAMPLE_DAYS: i64 = 14;

/// One client per `(tls_verify, follow_redirects)` combination; reqwest
/// fixes both at build time.
pub(crate) struct ClientSet {
    verify_follow: Client,
    verify_stay: Client,
    insecure_follow: Client,
    insecure_stay: Client,
}

impl ClientSet {
    pub(crate) fn build() -> Result<Self, ProbeEngineError> {
        let base = || Client::builder().user_agent(USER_AGENT);
        Ok(Self {
            verify_follow: base().redirect(Policy::limited(MAX_REDIRECT_HOPS)).build()?,
            verify_stay: base().redirect(Policy::none()).build()?,
            insecure_follow: base()
                .danger_accept_invalid_certs(true)
                .redirect(Policy::limited(MAX_REDIRECT_HOPS))
                .build()?,
            insecure_stay: base()
                .danger_accept_invalid_certs(true)
                .redirect(Policy::none())
                .build()?,
        })
    }

    fn select(&self, tls_verify: bool, follow_redirects: bool) -> &Client {
        match (tls_verify, follow_redirects) {
            (true, true) => &self.verify_follow,
            (true, false) => &self.verify_stay,
            (false, true) => &self.insecure_follow,
            (false, false) => &self.insecure_stay,
        }
    }
}

fn build_headers(pairs: &std::collections::BTreeMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    headers
}

/// Map a transport error to its wire kind. The chain is inspected for IO
/// error kinds first; the remainder falls back to message heuristics
/// because reqwest flattens DNS and TLS causes into opaque sources.
pub(crate) fn classify(err: &reqwest::Error) -> ProbeFailure {
    let detail = err.to_string();
    if err.is_timeout() {
        return ProbeFailure::with_detail(ErrorKind::Timeout, detail);
    }
    if err.is_redirect() {
        return ProbeFailure::with_detail(ErrorKind::RedirectLoop, detail);
    }
    if err.is_decode() || err.is_body() {
        return ProbeFailure::with_detail(ErrorKind::Decode, detail);
    }

    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    return ProbeFailure::with_detail(ErrorKind::ConnectionRefused, detail)
                }
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                    return ProbeFailure::with_detail(ErrorKind::ConnectionReset, detail)
                }
                std::io::ErrorKind::TimedOut => {
                    return ProbeFailure::with_detail(ErrorKind::Timeout, detail)
                }
                _ => {}
            }
        }
        source = std::error::Error::source(cause);
    }

    let lowered = detail.to_ascii_lowercase();
    if lowered.contains("dns") || lowered.contains("resolve") {
        ProbeFailure::with_detail(ErrorKind::Dns, detail)
    } else if lowered.contains("certificate") || lowered.contains("tls") || lowered.contains("handshake") {
        ProbeFailure::with_detail(ErrorKind::Tls, detail)
    } else {
        ProbeFailure::with_detail(ErrorKind::Protocol, detail)
    }
}

fn status_matches(status: StatusCode, expected: Option<u16>) -> bool {
    match expected {
        Some(code) => status.as_u16() == code,
        None => status.is_success(),
    }
}

async fn read_capped(response: Response, limit: usize) -> Result<Vec<u8>, reqwest::Error> {
    let mut body = Vec::new();
    let mut response = response;
    while let Some(chunk) = response.chunk().await? {
        let remaining = limit - body.len();
        if chunk.len() >= remaining {
            body.extend_from_slice(&chunk[..remaining]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

pub(crate) async fn probe_web(
    clients: &ClientSet,
    task: &ProbeTask,
    config: &WebConfig,
    keyword: Option<&str>,
    deadline: Duration,
) -> Outcome {
    let client = clients.select(config.tls_verify, config.follow_redirects);
    let method = Method::from_bytes(config.method.as_bytes()).unwrap_or(Method::GET);
    let start = Instant::now();

    let response = client
        .request(method, &task.target)
        .headers(build_headers(&config.headers))
        .timeout(deadline)
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(err) => {
            let mut outcome = Outcome::down(classify(&err));
            outcome.rtt_ms = Some(start.elapsed().as_secs_f64() * 1000.0);
            return outcome;
        }
    };

    let status = response.status();
    let rtt_ms = start.elapsed().as_secs_f64() * 1000.0;
    let mut sample = Sample::default();

    if !status_matches(status, config.expected_status) {
        let mut outcome = Outcome::down(ProbeFailure::with_detail(
            ErrorKind::Protocol,
            format!("unexpected status {status}"),
        ));
        outcome.status_code = Some(status.as_u16());
        outcome.rtt_ms = Some(rtt_ms);
        return outcome;
    }

    if let Some(substring) = keyword {
        let body = match read_capped(response, KEYWORD_SCAN_LIMIT).await {
            Ok(body) => body,
            Err(err) => {
                let mut outcome = Outcome::down(classify(&err));
                outcome.status_code = Some(status.as_u16());
                outcome.rtt_ms = Some(start.elapsed().as_secs_f64() * 1000.0);
                return outcome;
            }
        };
        sample.body_hash = Some(format!("{:x}", Sha256::digest(&body)));
        let haystack = String::from_utf8_lossy(&body);
        if !haystack.contains(substring) {
            let mut outcome = Outcome::down(ProbeFailure::with_detail(
                ErrorKind::Protocol,
                "expected substring not found",
            ));
            outcome.status_code = Some(status.as_u16());
            outcome.rtt_ms = Some(rtt_ms);
            outcome.sample = sample;
            return outcome;
        }
    }

    // Opportunistic certificate check; failures here never affect status.
    if config.tls_verify && task.target.starts_with("https://") {
        let budget = deadline.saturating_sub(start.elapsed());
        if !budget.is_zero() {
            match tls::expiry_days(&task.target, budget.min(Duration::from_secs(2))).await {
                Ok(days) if days < TLS_EXPIRY_SAMPLE_DAYS => sample.tls_expiry_days = Some(days),
                Ok(_) => {}
                Err(err) => debug!(target: "probe::tls", error = %err, "expiry check skipped"),
            }
        }
    }

    let mut outcome = if rtt_ms > degraded_threshold_ms(task.interval_seconds) {
        Outcome::degraded(Some(rtt_ms), None)
    } else {
        Outcome::up(Some(rtt_ms))
    };
    outcome.status_code = Some(status.as_u16());
    outcome.sample = sample;
    outcome
}

pub(crate) async fn probe_github(
    clients: &ClientSet,
    api_base: &str,
    config: &GithubConfig,
    deadline: Duration,
) -> Outcome {
    let url = format!("{}/repos/{}/{}", api_base, config.owner, config.repo);
    let start = Instant::now();
    let mut request = clients
        .select(true, true)
        .get(&url)
        .header("accept", "application/vnd.github+json")
        .timeout(deadline);
    if let Some(token) = &config.token {
        request = request.bearer_auth(token);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            let mut outcome = Outcome::down(classify(&err));
            outcome.rtt_ms = Some(start.elapsed().as_secs_f64() * 1000.0);
            return outcome;
        }
    };

    let status = response.status();
    let rtt_ms = start.elapsed().as_secs_f64() * 1000.0;
    let remaining = response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let reset = response
        .headers()
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut outcome = if remaining == Some(0) {
        Outcome::degraded(
            Some(rtt_ms),
            Some(ProbeFailure::with_detail(
                ErrorKind::RateLimited,
                format!("rate limit exhausted; resets at {}", reset.unwrap_or_default()),
            )),
        )
    } else if status.is_success() {
        Outcome::up(Some(rtt_ms))
    } else {
        Outcome::down(ProbeFailure::with_detail(
            ErrorKind::Protocol,
            format!("unexpected status {status}"),
        ))
    };
    outcome.status_code = Some(status.as_u16());
    outcome.rtt_ms = Some(rtt_ms);
    outcome
}

pub(crate) async fn probe_uptime_api(
    clients: &ClientSet,
    task: &ProbeTask,
    config: &UptimeApiConfig,
    deadline: Duration,
) -> Outcome {
    let start = Instant::now();
    let response = clients
        .select(true, true)
        .get(&task.target)
        .headers(build_headers(&config.headers))
        .timeout(deadline)
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(err) => {
            let mut outcome = Outcome::down(classify(&err));
            outcome.rtt_ms = Some(start.elapsed().as_secs_f64() * 1000.0);
            return outcome;
        }
    };

    let status = response.status();
    let body: serde_json::Value = match response.json().await {
        Ok(body) => body,
        Err(err) => {
            let mut outcome = Outcome::down(ProbeFailure::with_detail(
                ErrorKind::Decode,
                err.to_string(),
            ));
            outcome.status_code = Some(status.as_u16());
            return outcome;
        }
    };
    let rtt_ms = start.elapsed().as_secs_f64() * 1000.0;

    let mut outcome = match evaluate_predicate(&config.predicate, &body) {
        Ok(true) => Outcome::up(Some(rtt_ms)),
        Ok(false) => Outcome::down(ProbeFailure::with_detail(
            ErrorKind::Protocol,
            format!("predicate not satisfied: {}", config.predicate),
        )),
        Err(err) => Outcome::down(ProbeFailure::with_detail(
            ErrorKind::Protocol,
            format!("bad predicate: {err}"),
        )),
    };
    outcome.status_code = Some(status.as_u16());
    outcome.rtt_ms = Some(rtt_ms);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardant_core::{ServiceType, TypeConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal single-shot HTTP stub.
    async fn spawn_http_stub(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/")
    }

    fn task_for(target: String, config: TypeConfig) -> ProbeTask {
        let mut task = ProbeTask::synthetic_template();
        task.target = target;
        task.service_type = config.service_type();
        task.type_config = config;
        task
    }

    #[tokio::test]
    async fn web_up_on_matching_status() {
        let url =
            spawn_http_stub("HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                .await;
        let clients = ClientSet::build().unwrap();
        let task = task_for(url, TypeConfig::default_for(ServiceType::Web));
        let config = WebConfig::default();
        let outcome = probe_web(&clients, &task, &config, None, Duration::from_secs(2)).await;
        assert_eq!(outcome.status, ProbeStatus::Up);
        assert_eq!(outcome.status_code, Some(200));
        assert!(outcome.rtt_ms.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn web_down_on_unexpected_status() {
        let url = spawn_http_stub(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let clients = ClientSet::build().unwrap();
        let task = task_for(url, TypeConfig::default_for(ServiceType::Web));
        let config = WebConfig::default();
        let outcome = probe_web(&clients, &task, &config, None, Duration::from_secs(2)).await;
        assert_eq!(outcome.status, ProbeStatus::Down);
        assert_eq!(outcome.status_code, Some(503));
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn web_down_on_connection_refused() {
        let clients = ClientSet::build().unwrap();
        // Bind-then-drop leaves a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let task = task_for(
            format!("http://{addr}/"),
            TypeConfig::default_for(ServiceType::Web),
        );
        let config = WebConfig::default();
        let outcome = probe_web(&clients, &task, &config, None, Duration::from_secs(2)).await;
        assert_eq!(outcome.status, ProbeStatus::Down);
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn keyword_match_and_mismatch() {
        let url = spawn_http_stub(
            "HTTP/1.1 200 OK\r\ncontent-length: 12\r\nconnection: close\r\n\r\nhello worlds",
        )
        .await;
        let clients = ClientSet::build().unwrap();
        let task = task_for(url, TypeConfig::default_for(ServiceType::Keyword));
        let config = WebConfig::default();

        let hit = probe_web(&clients, &task, &config, Some("world"), Duration::from_secs(2)).await;
        assert_eq!(hit.status, ProbeStatus::Up);
        assert!(hit.sample.body_hash.is_some());

        let miss =
            probe_web(&clients, &task, &config, Some("absent"), Duration::from_secs(2)).await;
        assert_eq!(miss.status, ProbeStatus::Down);
        assert_eq!(miss.error.unwrap().kind, ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn github_rate_limited_is_degraded() {
        let url = spawn_http_stub(
            "HTTP/1.1 200 OK\r\nx-ratelimit-remaining: 0\r\nx-ratelimit-reset: 1700000000\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}",
        )
        .await;
        let clients = ClientSet::build().unwrap();
        let config = GithubConfig {
            owner: "guardant".into(),
            repo: "guardant".into(),
            token: None,
        };
        let base = url.trim_end_matches('/').to_string();
        let outcome = probe_github(&clients, &base, &config, Duration::from_secs(2)).await;
        assert_eq!(outcome.status, ProbeStatus::Degraded);
        let failure = outcome.error.unwrap();
        assert_eq!(failure.kind, ErrorKind::RateLimited);
        assert!(failure.detail.unwrap().contains("1700000000"));
    }

    #[tokio::test]
    async fn uptime_api_predicate() {
        let url = spawn_http_stub(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 15\r\nconnection: close\r\n\r\n{\"status\":\"ok\"}",
        )
        .await;
        let clients = ClientSet::build().unwrap();
        let task = task_for(url, TypeConfig::default_for(ServiceType::UptimeApi));

        let good = UptimeApiConfig {
            predicate: "status == \"ok\"".into(),
            headers: Default::default(),
        };
        let outcome = probe_uptime_api(&clients, &task, &good, Duration::from_secs(2)).await;
        assert_eq!(outcome.status, ProbeStatus::Up);

        let bad = UptimeApiConfig {
            predicate: "status == \"down\"".into(),
            headers: Default::default(),
        };
        let outcome = probe_uptime_api(&clients, &task, &bad, Duration::from_secs(2)).await;
        assert_eq!(outcome.status, ProbeStatus::Down);
    }
}
