//! The dispatch loop.
//!
//! One tick per second: due services get one task per chosen region,
//! suppressed while an earlier task for the same `(service, region)` is
//! still within its interval. Per-nest budgets delay rather than drop.
//! Tasks that vanish without a result produce a synthetic `down` with
//! kind `undeliverable` after one interval; three consecutive ticks with
//! no coverage produce a synthetic `down` with kind `no_coverage`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use guardant_bus::MessageBus;
use guardant_core::{
    ErrorKind, ProbeFailure, ProbeResult, ProbeStatus, ProbeTask, ResultSeen, Sample, Service,
};
use guardant_probe::ProbeEngine;
use guardant_registry::WorkerRegistry;
use guardant_store::{keys, TenantStore};
use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{load_catalog, load_worker_pool, CatalogEntry};
use crate::quota::NestQuotas;
use crate::routing::choose_regions;

pub const SYNTHETIC_WORKER_ID: &str = "coordinator";
const JITTER_PCT: f64 = 0.10;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] guardant_store::StoreError),
    #[error(transparent)]
    Bus(#[from] guardant_bus::BusError),
    #[error(transparent)]
    Registry(#[from] guardant_registry::RegistryError),
}

#[derive(Debug, Clone)]
struct InflightEntry {
    task_id: Uuid,
    published_at: DateTime<Utc>,
    interval_seconds: u32,
}

#[derive(Default)]
struct SchedulerState {
    next_due: HashMap<Uuid, DateTime<Utc>>,
    inflight: HashMap<(Uuid, String), InflightEntry>,
    round_robin: HashMap<Uuid, usize>,
    no_coverage_streak: HashMap<Uuid, u32>,
    quotas: NestQuotas,
    /// Quota-delayed tasks retried on subsequent ticks.
    delayed: Vec<ProbeTask>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    pub no_coverage_ticks: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            no_coverage_ticks: 3,
        }
    }
}

pub struct Coordinator {
    store: Arc<dyn TenantStore>,
    bus: Arc<dyn MessageBus>,
    registry: Arc<WorkerRegistry>,
    engine: ProbeEngine,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn TenantStore>,
        bus: Arc<dyn MessageBus>,
        registry: Arc<WorkerRegistry>,
        engine: ProbeEngine,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            engine,
            config,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Run the loop until cancelled, clearing in-flight entries as the
    /// aggregator reports consumed results.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), SchedulerError> {
        let mut seen = self.store.subscribe(keys::RESULTS_SEEN_CHANNEL).await?;
        let seen_self = Arc::clone(&self);
        let seen_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = seen_cancel.cancelled() => return,
                    received = seen.recv() => received,
                };
                let Some((_, payload)) = received else { return };
                if let Ok(notice) = serde_json::from_str::<ResultSeen>(&payload) {
                    seen_self.clear_inflight(&notice).await;
                }
            }
        });

        let mut ticker = tokio::time::interval(self.config.tick);
        info!(tick_ms = self.config.tick.as_millis() as u64, "coordinator started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.tick(Utc::now()).await {
                warn!(error = %err, "scheduling tick failed");
            }
        }
    }

    async fn clear_inflight(&self, notice: &ResultSeen) {
        let mut state = self.state.lock().await;
        let key = (notice.service_id, notice.region.clone());
        if let Some(entry) = state.inflight.get(&key) {
            if entry.task_id == notice.task_id {
                state.inflight.remove(&key);
            }
        }
    }

    /// One scheduling pass. Public for tests; production drives it from
    /// [`Coordinator::run`].
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let catalog = load_catalog(self.store.as_ref()).await?;
        let pool = load_worker_pool(&self.registry).await?;
        let mut state = self.state.lock().await;

        self.expire_inflight(&mut state, now).await?;
        self.flush_delayed(&mut state, now).await?;

        for entry in &catalog {
            let due = state
                .next_due
                .get(&entry.service.id)
                .copied()
                .unwrap_or(now);
            if due > now {
                continue;
            }

            if entry.service.service_type.is_passive() {
                self.evaluate_passive(entry, now).await?;
                Self::advance_next_due(&mut state, &entry.service, now);
                continue;
            }

            let cursor = *state.round_robin.entry(entry.service.id).or_insert(0);
            let regions = choose_regions(&entry.service, &pool, cursor);
            state
                .round_robin
                .insert(entry.service.id, cursor.wrapping_add(1));

            if regions.is_empty() {
                let streak = state
                    .no_coverage_streak
                    .entry(entry.service.id)
                    .or_insert(0);
                *streak += 1;
                metrics::counter!("guardant_coordinator_no_coverage_ticks", 1);
                if *streak >= self.config.no_coverage_ticks {
                    warn!(service_id = %entry.service.id, "no worker coverage; injecting synthetic down");
                    self.inject_synthetic(
                        entry,
                        entry
                            .service
                            .regions
                            .first()
                            .cloned()
                            .unwrap_or_else(|| "unknown".to_string()),
                        ErrorKind::NoCoverage,
                        now,
                    )
                    .await?;
                    *state.no_coverage_streak.get_mut(&entry.service.id).unwrap() = 0;
                    Self::advance_next_due(&mut state, &entry.service, now);
                }
                continue;
            }
            state.no_coverage_streak.remove(&entry.service.id);

            for region in regions {
                let key = (entry.service.id, region.clone());
                if let Some(inflight) = state.inflight.get(&key) {
                    let age = (now - inflight.published_at).num_seconds();
                    if age < inflight.interval_seconds as i64 {
                        debug!(service_id = %entry.service.id, region, "in-flight task; suppressed");
                        continue;
                    }
                }

                let task = ProbeTask::for_service(
                    &entry.service,
                    region.clone(),
                    entry.nest.subscription.tier.dispatch_priority(),
                    now,
                );
                if !state
                    .quotas
                    .try_dispatch(entry.nest.id, entry.nest.subscription.tier.rpm_per_nest())
                {
                    debug!(nest_id = %entry.nest.id, "nest rpm budget exhausted; task delayed");
                    state.delayed.push(task);
                    continue;
                }
                self.publish(&mut state, task).await?;
            }
            Self::advance_next_due(&mut state, &entry.service, now);
        }
        Ok(())
    }

    async fn publish(
        &self,
        state: &mut SchedulerState,
        task: ProbeTask,
    ) -> Result<(), SchedulerError> {
        state.inflight.insert(
            task.flight_key(),
            InflightEntry {
                task_id: task.task_id,
                published_at: task.not_before,
                interval_seconds: task.interval_seconds,
            },
        );
        metrics::counter!("guardant_coordinator_tasks_dispatched", 1);
        self.bus.publish_task(&task).await?;
        Ok(())
    }

    fn advance_next_due(state: &mut SchedulerState, service: &Service, now: DateTime<Utc>) {
        let jitter = rand::thread_rng().gen_range(-JITTER_PCT..JITTER_PCT);
        let interval_ms = service.interval_seconds as f64 * 1000.0 * (1.0 + jitter);
        state.next_due.insert(
            service.id,
            now + chrono::Duration::milliseconds(interval_ms as i64),
        );
    }

    /// Tasks that saw neither a result nor broker redelivery within one
    /// interval are written off with a synthetic `undeliverable`.
    async fn expire_inflight(
        &self,
        state: &mut SchedulerState,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let expired: Vec<((Uuid, String), InflightEntry)> = state
            .inflight
            .iter()
            .filter(|(_, entry)| {
                (now - entry.published_at).num_seconds() > entry.interval_seconds as i64
            })
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();

        for ((service_id, region), entry) in expired {
            state.inflight.remove(&(service_id, region.clone()));
            // The service might have been deleted meanwhile.
            let Some(service_key) = self.find_service_key(service_id).await? else {
                continue;
            };
            let Some(service) =
                guardant_store::get_json::<Service>(self.store.as_ref(), &service_key).await?
            else {
                continue;
            };
            warn!(service_id = %service_id, region, task_id = %entry.task_id, "task undeliverable");
            let result = ProbeResult {
                result_id: Uuid::new_v4(),
                task_id: entry.task_id,
                service_id,
                nest_id: service.nest_id,
                worker_id: SYNTHETIC_WORKER_ID.to_string(),
                region,
                service_type: service.service_type,
                started_at: now,
                rtt_ms: None,
                status: ProbeStatus::Down,
                status_code: None,
                error: Some(ProbeFailure::new(ErrorKind::Undeliverable)),
                sample: Sample::default(),
            };
            self.bus.publish_result(&result).await?;
        }
        Ok(())
    }

    async fn find_service_key(&self, service_id: Uuid) -> Result<Option<String>, SchedulerError> {
        let suffix = format!(":{service_id}");
        let keys = guardant_store::scan_all(self.store.as_ref(), "service:").await?;
        Ok(keys.into_iter().find(|key| key.ends_with(&suffix)))
    }

    async fn flush_delayed(
        &self,
        state: &mut SchedulerState,
        _now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let delayed = std::mem::take(&mut state.delayed);
        for task in delayed {
            let rpm = guardant_store::get_json::<guardant_core::Nest>(
                self.store.as_ref(),
                &keys::nest(task.nest_id),
            )
            .await?
            .map(|nest| nest.subscription.tier.rpm_per_nest())
            .unwrap_or(60);
            if state.quotas.try_dispatch(task.nest_id, rpm) {
                self.publish(state, task).await?;
            } else {
                state.delayed.push(task);
            }
        }
        Ok(())
    }

    /// Heartbeat-type services never reach workers; the engine evaluates
    /// them against the ingest store and the result joins the normal
    /// stream.
    async fn evaluate_passive(
        &self,
        entry: &CatalogEntry,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let task = ProbeTask::for_service(
            &entry.service,
            entry
                .service
                .regions
                .first()
                .cloned()
                .unwrap_or_else(|| "global".to_string()),
            entry.nest.subscription.tier.dispatch_priority(),
            now,
        );
        let result = self.engine.execute(&task).await;
        self.bus.publish_result(&result).await?;
        Ok(())
    }

    async fn inject_synthetic(
        &self,
        entry: &CatalogEntry,
        region: String,
        kind: ErrorKind,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let result = ProbeResult {
            result_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            service_id: entry.service.id,
            nest_id: entry.nest.id,
            worker_id: SYNTHETIC_WORKER_ID.to_string(),
            region,
            service_type: entry.service.service_type,
            started_at: now,
            rtt_ms: None,
            status: ProbeStatus::Down,
            status_code: None,
            error: Some(ProbeFailure::new(kind)),
            sample: Sample::default(),
        };
        self.bus.publish_result(&result).await?;
        Ok(())
    }
}

/// Store-backed heartbeat source for passive service evaluation.
pub struct StoreHeartbeatSource {
    store: Arc<dyn TenantStore>,
}

impl StoreHeartbeatSource {
    pub fn new(store: Arc<dyn TenantStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl guardant_probe::HeartbeatSource for StoreHeartbeatSource {
    async fn last_heartbeat(&self, nest_id: Uuid, service_id: Uuid) -> Option<DateTime<Utc>> {
        let raw = self
            .store
            .get(&keys::service_heartbeat(nest_id, service_id))
            .await
            .ok()??;
        raw.parse::<DateTime<Utc>>().ok()
    }
}
