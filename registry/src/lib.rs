//! Worker registry: the gate deciding which processes may consume tasks.
//!
//! Owns the registration records, the pending-approval queue, issued
//! broker credentials and the heartbeat view. Lifecycle:
//! `pending -> approved -> (active | suspended) -> deleted`. Credentials
//! exist only for approved workers and are revoked on rejection or
//! deletion.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use guardant_bus::{BusError, MessageBus};
use guardant_core::worker::HEARTBEAT_TTL_SECONDS;
use guardant_core::{
    derive_region_id, BrokerCredentials, CommandEnvelope, CommandTarget, ControlCommand,
    Heartbeat, WorkerRegistration,
};
use guardant_store::{get_json, keys, scan_all, set_json, StoreError, TenantStore};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("worker {0} is not registered")]
    NotFound(String),
    #[error("worker {0} is not approved")]
    NotApproved(String),
    #[error("heartbeat token rejected for worker {0}")]
    BadToken(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    All,
    Pending,
    Approved,
}

/// Aggregated view of one region derived from live heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionView {
    pub region_id: String,
    pub display_name: String,
    pub worker_count: usize,
    pub active_count: usize,
    pub avg_latency_ms: Option<f64>,
    pub uptime_pct: f64,
}

pub struct WorkerRegistry {
    store: Arc<dyn TenantStore>,
    bus: Arc<dyn MessageBus>,
    /// Broker host part used when materialising credential URLs.
    broker_url: String,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn TenantStore>, bus: Arc<dyn MessageBus>, broker_url: impl Into<String>) -> Self {
        Self {
            store,
            bus,
            broker_url: broker_url.into(),
        }
    }

    /// Idempotent on `worker_id`: a re-registration refreshes location and
    /// capabilities but never resurrects revoked approval.
    pub async fn register(&self, mut registration: WorkerRegistration) -> Result<WorkerRegistration, RegistryError> {
        let key = keys::worker_registration(&registration.worker_id);
        if let Some(existing) = get_json::<WorkerRegistration>(self.store.as_ref(), &key).await? {
            registration.status = existing.status;
            registration.counters = existing.counters;
            registration.registered_at = existing.registered_at;
        } else {
            registration.registered_at = Utc::now();
            self.store
                .zadd(
                    keys::WORKERS_PENDING,
                    &registration.worker_id,
                    registration.registered_at.timestamp() as f64,
                )
                .await?;
            info!(worker_id = %registration.worker_id, "worker registered, pending approval");
        }
        set_json(self.store.as_ref(), &key, &registration).await?;
        self.store
            .zadd(
                &keys::workers_by_owner(&registration.owner_email),
                &registration.worker_id,
                registration.registered_at.timestamp() as f64,
            )
            .await?;
        Ok(registration)
    }

    pub async fn get(&self, worker_id: &str) -> Result<WorkerRegistration, RegistryError> {
        get_json(self.store.as_ref(), &keys::worker_registration(worker_id))
            .await?
            .ok_or_else(|| RegistryError::NotFound(worker_id.to_string()))
    }

    /// Approve a pending worker: issue scoped broker credentials and
    /// assign its task region. Caller authorisation happens at the API
    /// layer.
    pub async fn approve(&self, worker_id: &str, region: Option<String>) -> Result<WorkerRegistration, RegistryError> {
        let mut registration = self.get(worker_id).await?;
        let region = region.unwrap_or_else(|| {
            derive_region_id(&registration.location.city, &registration.location.country)
        });

        let credentials = self.issue_credentials(worker_id);
        registration.status.approved = true;
        registration.status.suspended = false;
        registration.status.region = Some(region);
        registration.status.credentials = Some(credentials);

        set_json(
            self.store.as_ref(),
            &keys::worker_registration(worker_id),
            &registration,
        )
        .await?;
        self.store.zrem(keys::WORKERS_PENDING, worker_id).await?;
        info!(worker_id, "worker approved and credentials issued");
        Ok(registration)
    }

    fn issue_credentials(&self, worker_id: &str) -> BrokerCredentials {
        let username = format!("worker-{worker_id}");
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let password: String = secret.iter().map(|b| format!("{b:02x}")).collect();

        // Inject the credential pair into the broker URL.
        let amqp_url = match self.broker_url.split_once("://") {
            Some((scheme, rest)) => {
                let host = rest.split_once('@').map(|(_, host)| host).unwrap_or(rest);
                format!("{scheme}://{username}:{password}@{host}")
            }
            None => self.broker_url.clone(),
        };
        BrokerCredentials {
            username,
            password,
            amqp_url,
        }
    }

    /// Remove a registration entirely; issued credentials die with it.
    pub async fn reject(&self, worker_id: &str) -> Result<(), RegistryError> {
        let registration = self.get(worker_id).await?;
        self.purge(&registration).await?;
        info!(worker_id, "worker rejected");
        Ok(())
    }

    pub async fn delete(&self, worker_id: &str) -> Result<(), RegistryError> {
        let registration = self.get(worker_id).await?;
        self.purge(&registration).await?;
        info!(worker_id, "worker deleted");
        Ok(())
    }

    async fn purge(&self, registration: &WorkerRegistration) -> Result<(), RegistryError> {
        let worker_id = &registration.worker_id;
        self.store.del(&keys::worker_registration(worker_id)).await?;
        self.store.del(&keys::worker_heartbeat(worker_id)).await?;
        self.store.zrem(keys::WORKERS_PENDING, worker_id).await?;
        self.store
            .zrem(&keys::workers_by_owner(&registration.owner_email), worker_id)
            .await?;
        Ok(())
    }

    pub async fn suspend(&self, worker_id: &str) -> Result<(), RegistryError> {
        self.set_suspended(worker_id, true).await?;
        self.bus
            .publish_command(&CommandEnvelope::new(
                CommandTarget::Worker(worker_id.to_string()),
                ControlCommand::Suspend,
            ))
            .await?;
        Ok(())
    }

    pub async fn resume(&self, worker_id: &str) -> Result<(), RegistryError> {
        self.set_suspended(worker_id, false).await?;
        self.bus
            .publish_command(&CommandEnvelope::new(
                CommandTarget::Worker(worker_id.to_string()),
                ControlCommand::Resume,
            ))
            .await?;
        Ok(())
    }

    async fn set_suspended(&self, worker_id: &str, suspended: bool) -> Result<(), RegistryError> {
        let mut registration = self.get(worker_id).await?;
        if !registration.status.approved {
            return Err(RegistryError::NotApproved(worker_id.to_string()));
        }
        registration.status.suspended = suspended;
        set_json(
            self.store.as_ref(),
            &keys::worker_registration(worker_id),
            &registration,
        )
        .await?;
        Ok(())
    }

    pub async fn change_region(&self, worker_id: &str, new_region: String) -> Result<(), RegistryError> {
        let mut registration = self.get(worker_id).await?;
        if !registration.status.approved {
            return Err(RegistryError::NotApproved(worker_id.to_string()));
        }
        registration.status.region = Some(new_region.clone());
        set_json(
            self.store.as_ref(),
            &keys::worker_registration(worker_id),
            &registration,
        )
        .await?;
        self.bus
            .publish_command(&CommandEnvelope::new(
                CommandTarget::Worker(worker_id.to_string()),
                ControlCommand::ChangeRegion { new_region },
            ))
            .await?;
        Ok(())
    }

    pub async fn list(&self, filter: ListFilter) -> Result<Vec<WorkerRegistration>, RegistryError> {
        let mut registrations = Vec::new();
        for key in scan_all(self.store.as_ref(), keys::WORKER_REGISTRATION_PREFIX).await? {
            let Some(registration) =
                get_json::<WorkerRegistration>(self.store.as_ref(), &key).await?
            else {
                continue;
            };
            let keep = match filter {
                ListFilter::All => true,
                ListFilter::Pending => !registration.status.approved,
                ListFilter::Approved => registration.status.approved,
            };
            if keep {
                registrations.push(registration);
            }
        }
        registrations.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(registrations)
    }

    pub async fn list_by_owner(&self, email: &str) -> Result<Vec<WorkerRegistration>, RegistryError> {
        let ids = self
            .store
            .zrange_by_score(&keys::workers_by_owner(email), f64::MIN, f64::MAX)
            .await?;
        let mut registrations = Vec::new();
        for id in ids {
            if let Ok(registration) = self.get(&id).await {
                registrations.push(registration);
            }
        }
        Ok(registrations)
    }

    /// Top earners by lifetime points.
    pub async fn leaderboard(&self, limit: usize) -> Result<Vec<WorkerRegistration>, RegistryError> {
        let mut registrations = self.list(ListFilter::Approved).await?;
        registrations.sort_by(|a, b| {
            b.counters
                .total_points
                .total_cmp(&a.counters.total_points)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });
        registrations.truncate(limit);
        Ok(registrations)
    }

    /// Accept a heartbeat authenticated by the issued credential secret.
    /// The worker is the authority for its counters; the registry only
    /// mirrors them.
    pub async fn record_heartbeat(
        &self,
        worker_id: &str,
        token: &str,
        heartbeat: &Heartbeat,
    ) -> Result<(), RegistryError> {
        let mut registration = self.get(worker_id).await?;
        let authorised = registration
            .status
            .credentials
            .as_ref()
            .map(|c| c.password == token)
            .unwrap_or(false);
        if !authorised {
            warn!(worker_id, "heartbeat with invalid token");
            return Err(RegistryError::BadToken(worker_id.to_string()));
        }

        self.store
            .set_ttl(
                &keys::worker_heartbeat(worker_id),
                &serde_json::to_string(heartbeat).map_err(StoreError::from)?,
                Duration::from_secs(HEARTBEAT_TTL_SECONDS),
            )
            .await?;

        registration.status.last_heartbeat = Some(heartbeat.last_seen);
        registration.status.version = Some(heartbeat.version.clone());
        registration.counters.checks_ok = heartbeat.checks_ok;
        registration.counters.checks_fail = heartbeat.checks_fail;
        registration.counters.total_points = heartbeat.total_points;
        registration.counters.current_period_points = heartbeat.current_period_points;
        registration.counters.avg_rt_ms = heartbeat.avg_rt_ms;
        set_json(
            self.store.as_ref(),
            &keys::worker_registration(worker_id),
            &registration,
        )
        .await?;
        Ok(())
    }

    /// Every live heartbeat entry (TTL-expired entries excluded by the
    /// store).
    pub async fn live_heartbeats(&self) -> Result<Vec<Heartbeat>, RegistryError> {
        let mut heartbeats = Vec::new();
        for key in scan_all(self.store.as_ref(), keys::WORKER_HEARTBEAT_PREFIX).await? {
            if let Some(heartbeat) = get_json::<Heartbeat>(self.store.as_ref(), &key).await? {
                heartbeats.push(heartbeat);
            }
        }
        Ok(heartbeats)
    }

    /// Group approved workers by location into the region table shown to
    /// operators. Active-ratio drives the region's uptime percentage.
    pub async fn regions_view(&self) -> Result<Vec<RegionView>, RegistryError> {
        let now = Utc::now();
        let registrations = self.list(ListFilter::Approved).await?;
        let heartbeats: BTreeMap<String, Heartbeat> = self
            .live_heartbeats()
            .await?
            .into_iter()
            .map(|hb| (hb.worker_id.clone(), hb))
            .collect();

        let mut groups: BTreeMap<String, (String, Vec<&WorkerRegistration>)> = BTreeMap::new();
        for registration in &registrations {
            let region_id = registration.status.region.clone().unwrap_or_else(|| {
                derive_region_id(&registration.location.city, &registration.location.country)
            });
            let display = format!(
                "{}, {}",
                registration.location.city, registration.location.country
            );
            groups
                .entry(region_id)
                .or_insert_with(|| (display, Vec::new()))
                .1
                .push(registration);
        }

        let mut views = Vec::new();
        for (region_id, (display_name, members)) in groups {
            let worker_count = members.len();
            let mut active_count = 0;
            let mut latencies = Vec::new();
            for member in &members {
                if let Some(heartbeat) = heartbeats.get(&member.worker_id) {
                    if heartbeat.is_active(now) {
                        active_count += 1;
                        if heartbeat.avg_rt_ms > 0.0 {
                            latencies.push(heartbeat.avg_rt_ms);
                        }
                    }
                }
            }
            let avg_latency_ms = if latencies.is_empty() {
                None
            } else {
                Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
            };
            views.push(RegionView {
                region_id,
                display_name,
                worker_count,
                active_count,
                avg_latency_ms,
                uptime_pct: if worker_count == 0 {
                    0.0
                } else {
                    active_count as f64 / worker_count as f64 * 100.0
                },
            });
        }
        Ok(views)
    }
}
