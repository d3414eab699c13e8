//! HTTP client for the control-plane registration surface.

use std::time::Duration;

use guardant_core::{BrokerCredentials, Heartbeat, WorkerCapabilities, WorkerLocation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryClientError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registration rejected")]
    Rejected,
    #[error("worker credentials rejected")]
    Unauthorized,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub worker_id: String,
    pub owner_email: String,
    pub version: String,
    pub location: WorkerLocation,
    pub capabilities: WorkerCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationState {
    pub approved: bool,
    pub suspended: bool,
    #[serde(default)]
    pub credentials: Option<BrokerCredentials>,
}

pub struct RegistryClient {
    client: reqwest::Client,
    base_url: String,
    worker_id: String,
    /// Bearer for heartbeat writes once credentials are issued.
    token: parking_lot::Mutex<Option<String>>,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            worker_id: worker_id.into(),
            token: parking_lot::Mutex::new(None),
        }
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.lock() = Some(token.into());
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<RegistrationState, RegistryClientError> {
        let response = self
            .client
            .post(format!("{}/api/workers/register", self.base_url))
            .json(request)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(RegistryClientError::Rejected);
        }
        Ok(response.error_for_status()?.json().await?)
    }

    pub async fn registration_state(&self) -> Result<RegistrationState, RegistryClientError> {
        let response = self
            .client
            .get(format!(
                "{}/api/workers/{}/registration",
                self.base_url, self.worker_id
            ))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryClientError::Rejected);
        }
        Ok(response.error_for_status()?.json().await?)
    }

    /// Poll until approval, with jittered exponential backoff from 5 s up
    /// to 2 min.
    pub async fn wait_for_approval(
        &self,
        request: &RegisterRequest,
    ) -> Result<BrokerCredentials, RegistryClientError> {
        let state = self.register(request).await?;
        if let Some(credentials) = approved_credentials(&state) {
            return Ok(credentials);
        }
        info!(worker_id = %self.worker_id, "registration pending approval");

        let mut delay = Duration::from_secs(5);
        let cap = Duration::from_secs(120);
        loop {
            let jitter = rand::thread_rng().gen_range(0.8..1.2);
            tokio::time::sleep(delay.mul_f64(jitter)).await;
            match self.registration_state().await {
                Ok(state) => {
                    if let Some(credentials) = approved_credentials(&state) {
                        info!(worker_id = %self.worker_id, "worker approved");
                        return Ok(credentials);
                    }
                    debug!(worker_id = %self.worker_id, "still pending");
                }
                Err(RegistryClientError::Rejected) => return Err(RegistryClientError::Rejected),
                Err(err) => warn!(error = %err, "approval poll failed"),
            }
            delay = (delay * 2).min(cap);
        }
    }

    pub async fn send_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), RegistryClientError> {
        let token = self.token.lock().clone().unwrap_or_default();
        let response = self
            .client
            .post(format!(
                "{}/api/workers/{}/heartbeat",
                self.base_url, self.worker_id
            ))
            .bearer_auth(token)
            .json(heartbeat)
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        match response.status() {
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(RegistryClientError::Unauthorized)
            }
            _ => {
                response.error_for_status()?;
                Ok(())
            }
        }
    }
}

fn approved_credentials(state: &RegistrationState) -> Option<BrokerCredentials> {
    if state.approved && !state.suspended {
        state.credentials.clone()
    } else {
        None
    }
}
