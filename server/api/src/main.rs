use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use guardant_aggregator::{Aggregator, AggregatorConfig};
use guardant_api::auth::{install_token, Principal, Role};
use guardant_api::{router, AppState};
use guardant_bus::memory::InMemoryBus;
use guardant_bus::redis_bus::RedisBus;
use guardant_bus::MessageBus;
use guardant_observability::{init, LogFormat, TracingConfig};
use guardant_registry::WorkerRegistry;
use guardant_server_core::config::{self, ConfigOverrides};
use guardant_store::memory::MemoryStore;
use guardant_store::redis_store::RedisStore;
use guardant_store::TenantStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug, Clone)]
#[command(name = "guardant-server", about = "GuardAnt control plane and status API")]
struct ServerCli {
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    #[arg(long)]
    profile: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
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
    let cli = ServerCli::parse();
    let config = config::load(ConfigOverrides {
        config_path: cli.config.clone(),
        profile: cli.profile.clone(),
        server_host: cli.host.clone(),
        server_port: cli.port,
        store_url: cli.store_url.clone(),
        bus_url: cli.bus_url.clone(),
        log_level: cli.log_level.clone(),
        log_format: cli.log_format.clone(),
    })
    .context("configuration load failed")?;

    let (_guard, exporter) = init(
        &TracingConfig {
            service_name: "guardant-server".into(),
            log_format: LogFormat::from_str(&config.observability.log_format)?,
            log_level: config.observability.log_level.clone(),
        },
        None,
    )?;

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

    // Bootstrap a platform-admin token from the environment, if set.
    if let Ok(token) = std::env::var("GUARDANT_ADMIN_TOKEN") {
        if !token.is_empty() {
            install_token(
                store.as_ref(),
                &token,
                &Principal {
                    user_id: "platform-admin".into(),
                    nest_id: None,
                    role: Role::PlatformAdmin,
                },
            )
            .await
            .context("admin token bootstrap failed")?;
            info!("platform admin token installed");
        }
    }

    let registry = Arc::new(WorkerRegistry::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        config.bus.url.clone(),
    ));

    let cancel = CancellationToken::new();
    let aggregator = Arc::new(Aggregator::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        AggregatorConfig::default(),
    ));
    let aggregator_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = aggregator.run(aggregator_cancel).await {
            warn!(error = %err, "aggregator stopped");
        }
    });

    let state = AppState::new(store, bus, registry).with_metrics(exporter);
    let app = router(state);

    let addr = config.server.bind_address().context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind failed on {addr}"))?;
    info!(%addr, "guardant server listening");

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_cancel.cancel();
        })
        .await
        .context("server failed")?;
    Ok(())
}
