//! The worker agent: task consumption, probe execution, buffering,
//! heartbeats and control-command handling.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use guardant_bus::{BusError, MessageBus};
use guardant_core::{ControlCommand, Heartbeat, ProbeStatus, WorkerCapabilities};
use guardant_probe::ProbeEngine;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::ResultBuffer;
use crate::config::WorkerConfig;
use crate::control::{exec_after_delay, Updater};
use crate::points::PointsLedger;
use crate::registry_client::{RegistryClient, RegistryClientError};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Buffer fill ratio past which task consumption pauses.
const BUFFER_PAUSE_RATIO: f64 = 0.8;
/// Publish lag past which effective concurrency is halved.
const PUBLISH_LAG_LIMIT: Duration = Duration::from_secs(5);
const AUTH_STRIKE_LIMIT: usize = 3;
const MAX_TASK_REDELIVERIES: u32 = 3;
const AUTH_STRIKE_WINDOW: Duration = Duration::from_secs(300);

/// Why the agent loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    Shutdown,
    /// Credentials rejected repeatedly; re-enter the registration flow.
    Reregister,
}

/// Rolling window of authentication failures (the 3-strike rule).
#[derive(Default)]
pub struct AuthStrikes {
    hits: Mutex<Vec<Instant>>,
}

impl AuthStrikes {
    pub fn record(&self) -> bool {
        let mut hits = self.hits.lock();
        let now = Instant::now();
        hits.retain(|at| now.duration_since(*at) < AUTH_STRIKE_WINDOW);
        hits.push(now);
        hits.len() >= AUTH_STRIKE_LIMIT
    }
}

/// Shared mutable agent state; probes touch only atomics.
pub struct AgentState {
    pub suspended: AtomicBool,
    pub connected: AtomicBool,
    pub inflight: AtomicUsize,
    pub effective_concurrency: AtomicUsize,
    pub checks_ok: AtomicU64,
    pub checks_fail: AtomicU64,
    rtt_accum: Mutex<(f64, u64)>,
    pub last_update_error: Mutex<Option<String>>,
    pub started_at: DateTime<Utc>,
}

impl AgentState {
    fn new(concurrency: usize) -> Self {
        Self {
            suspended: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            inflight: AtomicUsize::new(0),
            effective_concurrency: AtomicUsize::new(concurrency),
            checks_ok: AtomicU64::new(0),
            checks_fail: AtomicU64::new(0),
            rtt_accum: Mutex::new((0.0, 0)),
            last_update_error: Mutex::new(None),
            started_at: Utc::now(),
        }
    }

    fn record_rtt(&self, rtt_ms: f64) {
        let mut accum = self.rtt_accum.lock();
        accum.0 += rtt_ms;
        accum.1 += 1;
    }

    pub fn avg_rt_ms(&self) -> f64 {
        let accum = self.rtt_accum.lock();
        if accum.1 == 0 {
            0.0
        } else {
            accum.0 / accum.1 as f64
        }
    }
}

/// Token bucket enforcing the capability `rpm` limit.
pub struct RateGate {
    state: Mutex<(f64, Instant)>,
    capacity: f64,
    per_second: f64,
}

impl RateGate {
    pub fn new(rpm: u32) -> Self {
        Self {
            state: Mutex::new((rpm as f64, Instant::now())),
            capacity: rpm as f64,
            per_second: rpm as f64 / 60.0,
        }
    }

    fn try_take(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let refill = now.duration_since(state.1).as_secs_f64() * self.per_second;
        state.0 = (state.0 + refill).min(self.capacity);
        state.1 = now;
        if state.0 >= 1.0 {
            state.0 -= 1.0;
            true
        } else {
            false
        }
    }

    pub async fn acquire(&self) {
        while !self.try_take() {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

pub struct WorkerAgent {
    config: WorkerConfig,
    capabilities: WorkerCapabilities,
    engine: Arc<ProbeEngine>,
    bus: Arc<dyn MessageBus>,
    buffer: Arc<ResultBuffer>,
    registry: Arc<RegistryClient>,
    ledger: Arc<PointsLedger>,
    state: Arc<AgentState>,
    strikes: Arc<AuthStrikes>,
    region: watch::Sender<String>,
    version: String,
}

impl WorkerAgent {
    pub fn new(
        config: WorkerConfig,
        capabilities: WorkerCapabilities,
        region: String,
        engine: ProbeEngine,
        bus: Arc<dyn MessageBus>,
        buffer: Arc<ResultBuffer>,
        registry: Arc<RegistryClient>,
    ) -> Self {
        let concurrency = config
            .concurrency
            .unwrap_or(capabilities.limits.max_concurrency);
        let (region_tx, _) = watch::channel(region);
        Self {
            config,
            capabilities,
            engine: Arc::new(engine),
            bus,
            buffer,
            registry,
            ledger: Arc::new(PointsLedger::new()),
            state: Arc::new(AgentState::new(concurrency)),
            strikes: Arc::new(AuthStrikes::default()),
            region: region_tx,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn state(&self) -> Arc<AgentState> {
        Arc::clone(&self.state)
    }

    pub fn ledger(&self) -> Arc<PointsLedger> {
        Arc::clone(&self.ledger)
    }

    pub fn buffer(&self) -> Arc<ResultBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn current_region(&self) -> String {
        self.region.borrow().clone()
    }

    /// Run until shutdown or a credentials trip. In-flight probes finish
    /// within their own deadlines on suspend; on shutdown they are
    /// cancelled and their partial results are not buffered.
    pub async fn run(&self, cancel: CancellationToken) -> AgentExit {
        let reregister = CancellationToken::new();

        let forwarder = self.spawn_forwarder(cancel.clone(), reregister.clone());
        let heartbeats = self.spawn_heartbeats(cancel.clone(), reregister.clone());
        let commands = self.spawn_command_loop(cancel.clone());
        let tasks = self.spawn_task_loop(cancel.clone());

        let exit = tokio::select! {
            _ = cancel.cancelled() => AgentExit::Shutdown,
            _ = reregister.cancelled() => {
                warn!("authentication strikes exhausted; re-entering registration");
                AgentExit::Reregister
            }
        };

        cancel.cancel();
        for handle in [forwarder, heartbeats, commands, tasks] {
            handle.abort();
        }
        exit
    }

    fn spawn_task_loop(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let engine = Arc::clone(&self.engine);
        let buffer = Arc::clone(&self.buffer);
        let ledger = Arc::clone(&self.ledger);
        let state = Arc::clone(&self.state);
        let capabilities = self.capabilities.clone();
        let mut region_rx = self.region.subscribe();
        let gate = Arc::new(RateGate::new(capabilities.limits.rpm));

        tokio::spawn(async move {
            'rebind: loop {
                let region = region_rx.borrow_and_update().clone();
                let consumer = match bus.consume_tasks(&region).await {
                    Ok(consumer) => consumer,
                    Err(err) => {
                        error!(region, error = %err, "task queue bind failed");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };
                info!(region, "consuming tasks");

                loop {
                    if cancel.is_cancelled() {
                        return;
                    }
                    if region_rx.has_changed().unwrap_or(false) {
                        continue 'rebind;
                    }
                    if state.suspended.load(Ordering::Relaxed)
                        || buffer.fill_ratio() > BUFFER_PAUSE_RATIO
                    {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                    while state.inflight.load(Ordering::Relaxed)
                        >= state.effective_concurrency.load(Ordering::Relaxed)
                    {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        if cancel.is_cancelled() {
                            return;
                        }
                    }
                    gate.acquire().await;

                    let delivery = tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = region_rx.changed() => continue 'rebind,
                        delivery = consumer.next() => match delivery {
                            Some(delivery) => delivery,
                            None => return,
                        },
                    };

                    if state.suspended.load(Ordering::Relaxed) {
                        // Suspension landed while parked on the queue; the
                        // dropped delivery goes back for another worker.
                        drop(delivery);
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                    if delivery.redelivered() >= MAX_TASK_REDELIVERIES {
                        // The dispatcher injects a synthetic result once the
                        // task's interval lapses without one.
                        warn!(task_id = %delivery.payload().task_id, "task exceeded redelivery cap; discarded");
                        delivery.ack();
                        continue;
                    }
                    if !capabilities.supports(delivery.payload().service_type) {
                        // Misrouted work goes back for an eligible peer.
                        debug!(service_type = %delivery.payload().service_type, "unsupported task requeued");
                        drop(delivery);
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }

                    state.inflight.fetch_add(1, Ordering::Relaxed);
                    let engine = Arc::clone(&engine);
                    let buffer = Arc::clone(&buffer);
                    let ledger = Arc::clone(&ledger);
                    let state = Arc::clone(&state);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let task = delivery.payload().clone();
                        let result = tokio::select! {
                            // Shutdown cancels in-flight probes outright.
                            _ = cancel.cancelled() => {
                                state.inflight.fetch_sub(1, Ordering::Relaxed);
                                return;
                            }
                            result = engine.execute(&task) => result,
                        };

                        match result.status {
                            ProbeStatus::Up | ProbeStatus::Degraded => {
                                state.checks_ok.fetch_add(1, Ordering::Relaxed);
                                ledger.record_success(result.service_type, &result.region);
                            }
                            ProbeStatus::Down => {
                                state.checks_fail.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        if let Some(rtt) = result.rtt_ms {
                            state.record_rtt(rtt);
                        }
                        metrics::counter!("guardant_worker_probes_total", 1);

                        match buffer.append(result) {
                            Ok(()) => {
                                delivery.ack();
                            }
                            Err(err) => {
                                // Unacked: the broker redelivers.
                                error!(error = %err, "buffer append failed");
                            }
                        }
                        state.inflight.fetch_sub(1, Ordering::Relaxed);
                    });
                }
            }
        })
    }

    /// Drains the buffer to the result queue with exponential backoff
    /// (base 30 s, cap 15 min, ±20 % jitter).
    fn spawn_forwarder(
        &self,
        cancel: CancellationToken,
        reregister: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let buffer = Arc::clone(&self.buffer);
        let state = Arc::clone(&self.state);
        let strikes = Arc::clone(&self.strikes);
        let configured = self.state.effective_concurrency.load(Ordering::Relaxed);

        tokio::spawn(async move {
            let base = Duration::from_secs(30);
            let cap = Duration::from_secs(15 * 60);
            let mut backoff = base;
            let mut failing_since: Option<Instant> = None;

            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let Some(result) = buffer.peek_oldest() else {
                    state
                        .effective_concurrency
                        .store(configured, Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    continue;
                };

                match bus.publish_result(&result).await {
                    Ok(()) => {
                        if let Err(err) = buffer.ack(result.result_id) {
                            error!(error = %err, "buffer ack failed");
                        }
                        state.connected.store(true, Ordering::Relaxed);
                        failing_since = None;
                        backoff = base;
                    }
                    Err(err) => {
                        state.connected.store(false, Ordering::Relaxed);
                        let lagging = *failing_since.get_or_insert_with(Instant::now);
                        if lagging.elapsed() > PUBLISH_LAG_LIMIT {
                            let current = state.effective_concurrency.load(Ordering::Relaxed);
                            let halved = (current / 2).max(1);
                            if halved < current {
                                warn!(from = current, to = halved, "publish lag; reducing concurrency");
                                state
                                    .effective_concurrency
                                    .store(halved, Ordering::Relaxed);
                            }
                        }
                        if matches!(err, BusError::Unauthorized) && strikes.record() {
                            reregister.cancel();
                            return;
                        }
                        let jitter = rand::Rng::gen_range(&mut rand::thread_rng(), 0.8..1.2);
                        warn!(error = %err, backoff_s = backoff.as_secs(), "result publish failed");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(backoff.mul_f64(jitter)) => {}
                        }
                        backoff = (backoff * 2).min(cap);
                    }
                }
            }
        })
    }

    fn spawn_heartbeats(
        &self,
        cancel: CancellationToken,
        reregister: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let state = Arc::clone(&self.state);
        let buffer = Arc::clone(&self.buffer);
        let ledger = Arc::clone(&self.ledger);
        let strikes = Arc::clone(&self.strikes);
        let worker_id = self.config.worker_id.clone();
        let version = self.version.clone();
        let region_rx = self.region.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let points = ledger.snapshot();
                let heartbeat = Heartbeat {
                    worker_id: worker_id.clone(),
                    version: version.clone(),
                    region: region_rx.borrow().clone(),
                    last_seen: Utc::now(),
                    checks_ok: state.checks_ok.load(Ordering::Relaxed),
                    checks_fail: state.checks_fail.load(Ordering::Relaxed),
                    total_points: points.total,
                    current_period_points: points.current_period,
                    avg_rt_ms: state.avg_rt_ms(),
                    buffer_depth: buffer.depth(),
                    connected: state.connected.load(Ordering::Relaxed),
                    last_update_error: state.last_update_error.lock().clone(),
                };
                match registry.send_heartbeat(&heartbeat).await {
                    Ok(()) => {}
                    Err(RegistryClientError::Unauthorized) => {
                        if strikes.record() {
                            reregister.cancel();
                            return;
                        }
                    }
                    Err(err) => debug!(error = %err, "heartbeat delivery failed"),
                }
            }
        })
    }

    fn spawn_command_loop(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let state = Arc::clone(&self.state);
        let ledger = Arc::clone(&self.ledger);
        let region_tx = self.region.clone();
        let worker_id = self.config.worker_id.clone();

        tokio::spawn(async move {
            let consumer = match bus.consume_commands(&worker_id).await {
                Ok(consumer) => consumer,
                Err(err) => {
                    error!(error = %err, "command queue bind failed");
                    return;
                }
            };
            loop {
                let envelope = tokio::select! {
                    _ = cancel.cancelled() => return,
                    delivery = consumer.next() => match delivery {
                        Some(delivery) => delivery.ack(),
                        None => return,
                    },
                };
                info!(command = ?envelope.command, "control command received");
                match envelope.command {
                    ControlCommand::Suspend => {
                        state.suspended.store(true, Ordering::Relaxed);
                    }
                    ControlCommand::Resume => {
                        state.suspended.store(false, Ordering::Relaxed);
                    }
                    ControlCommand::ChangeRegion { new_region } => {
                        let _ = region_tx.send(new_region);
                    }
                    ControlCommand::ResetPointsPeriod => {
                        ledger.reset_period();
                    }
                    ControlCommand::UpdateWorker {
                        repo,
                        version,
                        delay_ms,
                        ..
                    } => {
                        let updater = Updater::new("data/staging");
                        match updater.stage_release(&repo, &version).await {
                            Ok(binary) => {
                                tokio::spawn(exec_after_delay(
                                    binary,
                                    Duration::from_millis(delay_ms),
                                ));
                            }
                            Err(err) => {
                                warn!(error = %err, "self-update failed; keeping current version");
                                *state.last_update_error.lock() = Some(err.to_string());
                            }
                        }
                    }
                    ControlCommand::RebuildWorker { delay_ms } => {
                        let updater = Updater::new("data/staging");
                        match updater.rebuild(std::path::Path::new(".")).await {
                            Ok(binary) => {
                                tokio::spawn(exec_after_delay(
                                    binary,
                                    Duration::from_millis(delay_ms),
                                ));
                            }
                            Err(err) => {
                                warn!(error = %err, "rebuild failed; keeping current version");
                                *state.last_update_error.lock() = Some(err.to_string());
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardant_bus::memory::InMemoryBus;
    use guardant_core::{CommandEnvelope, CommandTarget, ProbeTask, ServiceType, TypeConfig};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn spawn_tcp_stub() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let _ = socket.write_all(b"hi").await;
            }
        });
        addr.to_string()
    }

    fn test_agent(bus: Arc<InMemoryBus>, dir: &tempfile::TempDir) -> WorkerAgent {
        let config = WorkerConfig {
            worker_id: "w-test".into(),
            broker_url: None,
            management_url: "http://127.0.0.1:1".into(),
            region: Some("eu-central-1".into()),
            concurrency: Some(4),
            health_port: 0,
            log_level: "info".into(),
            public_ip: None,
            datacenter: None,
            owner_email: "ops@example.com".into(),
            buffer_path: dir.path().join("wal.jsonl"),
        };
        let buffer = Arc::new(ResultBuffer::open(&config.buffer_path, 100).unwrap());
        let registry = Arc::new(RegistryClient::new("http://127.0.0.1:1", "w-test"));
        let engine = ProbeEngine::new("w-test").unwrap();
        WorkerAgent::new(
            config,
            WorkerCapabilities::default(),
            "eu-central-1".into(),
            engine,
            bus,
            buffer,
            registry,
        )
    }

    fn port_task(target: String) -> ProbeTask {
        let mut task = ProbeTask::synthetic_template();
        task.target = target;
        task.service_type = ServiceType::Port;
        task.type_config = TypeConfig::default_for(ServiceType::Port);
        task
    }

    #[tokio::test]
    async fn executes_task_and_forwards_result() {
        let bus = Arc::new(InMemoryBus::new());
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(Arc::clone(&bus), &dir);

        let target = spawn_tcp_stub().await;
        bus.publish_task(&port_task(target)).await.unwrap();

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let state = agent.state();
        let runner = tokio::spawn(async move { agent.run(run_cancel).await });

        let results = bus.consume_results().await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(10), results.next())
            .await
            .expect("result forwarded")
            .unwrap();
        let result = delivery.ack();
        assert_eq!(result.status, ProbeStatus::Up);
        assert_eq!(result.worker_id, "w-test");
        assert_eq!(state.checks_ok.load(Ordering::Relaxed), 1);

        cancel.cancel();
        assert_eq!(runner.await.unwrap(), AgentExit::Shutdown);
    }

    #[tokio::test]
    async fn suspend_command_stops_consumption() {
        let bus = Arc::new(InMemoryBus::new());
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(Arc::clone(&bus), &dir);
        let state = agent.state();

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let runner = tokio::spawn(async move { agent.run(run_cancel).await });

        bus.publish_command(&CommandEnvelope::new(
            CommandTarget::Worker("w-test".into()),
            ControlCommand::Suspend,
        ))
        .await
        .unwrap();

        // Wait for the command to land.
        for _ in 0..50 {
            if state.suspended.load(Ordering::Relaxed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(state.suspended.load(Ordering::Relaxed));

        let target = spawn_tcp_stub().await;
        bus.publish_task(&port_task(target)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        // Task stays queued while suspended.
        assert_eq!(bus.task_queue_depth("eu-central-1").await, 1);

        cancel.cancel();
        let _ = runner.await;
    }

    #[tokio::test]
    async fn rate_gate_enforces_budget() {
        let gate = RateGate::new(60); // one per second
        assert!(gate.try_take());
        // Bucket starts full; drain it.
        let mut taken = 1;
        while gate.try_take() {
            taken += 1;
        }
        assert!(taken >= 59);
        assert!(!gate.try_take());
    }

    #[test]
    fn auth_strikes_trip_at_three() {
        let strikes = AuthStrikes::default();
        assert!(!strikes.record());
        assert!(!strikes.record());
        assert!(strikes.record());
    }
}
