use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use guardant_bus::memory::InMemoryBus;
use guardant_bus::redis_bus::RedisBus;
use guardant_bus::MessageBus;
use guardant_coordinator::{Coordinator, SchedulerConfig, StoreHeartbeatSource};
use guardant_observability::{init_tracing, LogFormat, TracingConfig};
use guardant_probe::ProbeEngine;
use guardant_registry::WorkerRegistry;
use guardant_server_core::config::{self, ConfigOverrides};
use guardant_store::memory::MemoryStore;
use guardant_store::redis_store::RedisStore;
use guardant_store::TenantStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug, Clone)]
#[command(name = "guardant-coordinator", about = "GuardAnt probe dispatcher")]
struct CoordinatorCli {
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    #[arg(long)]
    profile: Option<String>,
    #[arg(long = "store-url")]
    store_url: Option<String>,
    #[arg(long = "bus-url")]
    bus_url: Option<String>,
    #[arg(long = "log-level")]
    log_level: Option<String>,
    #[arg(long = "log-format")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CoordinatorCli::parse();
    let config = config::load(ConfigOverrides {
        config_path: cli.config.clone(),
        profile: cli.profile.clone(),
        store_url: cli.store_url.clone(),
        bus_url: cli.bus_url.clone(),
        log_level: cli.log_level.clone(),
        log_format: cli.log_format.clone(),
        ..Default::default()
    })
    .context("configuration load failed")?;

    let _guard = init_tracing(&TracingConfig {
        service_name: "guardant-coordinator".into(),
        log_format: LogFormat::from_str(&config.observability.log_format)?,
        log_level: config.observability.log_level.clone(),
    })?;

    let store: Arc<dyn TenantStore> = if config.store.url == "memory" {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(
            RedisStore::connect(&config.store.url)
                .await
                .context("store connect failed")?,
        )
    };
    let bus: Arc<dyn MessageBus> = if config.bus.url == "memory" {
        Arc::new(InMemoryBus::new())
    } else {
        Arc::new(
            RedisBus::connect(&config.bus.url)
                .await
                .context("bus connect failed")?,
        )
    };

    let registry = Arc::new(WorkerRegistry::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        config.bus.url.clone(),
    ));
    let engine = ProbeEngine::new(guardant_coordinator::SYNTHETIC_WORKER_ID)?
        .with_heartbeat_source(Arc::new(StoreHeartbeatSource::new(Arc::clone(&store))));

    let coordinator = Arc::new(Coordinator::new(
        store,
        bus,
        registry,
        engine,
        SchedulerConfig {
            tick: Duration::from_millis(config.scheduler.tick_ms),
            no_coverage_ticks: config.scheduler.no_coverage_ticks,
        },
    ));

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    coordinator.run(cancel).await.context("coordinator loop failed")
}
