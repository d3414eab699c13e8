use std::sync::Arc;

use clap::Parser;
use guardant_bus::redis_bus::RedisBus;
use guardant_bus::{BusError, MessageBus};
use guardant_core::WorkerCapabilities;
use guardant_observability::{init_tracing, LogFormat, TracingConfig};
use guardant_probe::ProbeEngine;
use guardant_worker::agent::AgentExit;
use guardant_worker::buffer::BufferError;
use guardant_worker::config::{exit_code, WorkerCli, WorkerConfig};
use guardant_worker::geo::Geolocator;
use guardant_worker::health::{self, HealthContext};
use guardant_worker::registry_client::{RegisterRequest, RegistryClient, RegistryClientError};
use guardant_worker::{ResultBuffer, WorkerAgent, DEFAULT_MAX_ENTRIES};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const BROKER_CONNECT_ATTEMPTS: u32 = 5;

#[tokio::main]
async fn main() {
    let cli = WorkerCli::parse();
    let config = match WorkerConfig::load(cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(exit_code::CONFIG);
        }
    };

    let _guard = match init_tracing(&TracingConfig {
        service_name: "guardant-worker".into(),
        log_format: LogFormat::Pretty,
        log_level: config.log_level.clone(),
    }) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("tracing init failed: {err}");
            std::process::exit(exit_code::CONFIG);
        }
    };

    std::process::exit(run(config).await);
}

async fn run(config: WorkerConfig) -> i32 {
    let buffer = match ResultBuffer::open(&config.buffer_path, DEFAULT_MAX_ENTRIES) {
        Ok(buffer) => Arc::new(buffer),
        Err(BufferError::Corrupt(detail)) => {
            error!(detail, "result buffer corrupt");
            return exit_code::BUFFER_CORRUPT;
        }
        Err(err) => {
            error!(error = %err, "result buffer unavailable");
            return exit_code::BUFFER_CORRUPT;
        }
    };

    let geolocator = Geolocator::new("data/location-cache.json");
    let detected = geolocator.detect(config.public_ip.as_deref()).await;
    let region = config
        .region
        .clone()
        .unwrap_or_else(|| detected.region_id.clone());
    info!(region, city = %detected.location.city, "worker location resolved");

    let mut capabilities = WorkerCapabilities::default();
    if let Some(concurrency) = config.concurrency {
        capabilities.limits.max_concurrency = concurrency;
    }

    let registry = Arc::new(RegistryClient::new(
        config.management_url.clone(),
        config.worker_id.clone(),
    ));
    let register_request = RegisterRequest {
        worker_id: config.worker_id.clone(),
        owner_email: config.owner_email.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        location: detected.location.clone(),
        capabilities: capabilities.clone(),
        datacenter: config.datacenter.clone(),
    };

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    // Registration loop: a credentials trip inside the agent drops back
    // here into the pending flow.
    loop {
        let credentials = match registry.wait_for_approval(&register_request).await {
            Ok(credentials) => credentials,
            Err(RegistryClientError::Rejected) => {
                error!("registration rejected by the platform");
                return exit_code::UNAUTHORIZED;
            }
            Err(err) => {
                error!(error = %err, "registration failed");
                return exit_code::BROKER_UNREACHABLE;
            }
        };
        registry.set_token(credentials.password.clone());

        let broker_url = config
            .broker_url
            .clone()
            .unwrap_or_else(|| credentials.amqp_url.clone());
        let bus: Arc<dyn MessageBus> = match connect_broker(&broker_url).await {
            Ok(bus) => bus,
            Err(BusError::Unauthorized) => {
                error!("broker rejected issued credentials");
                return exit_code::UNAUTHORIZED;
            }
            Err(err) => {
                error!(error = %err, "broker unreachable after retries");
                return exit_code::BROKER_UNREACHABLE;
            }
        };

        let engine = match ProbeEngine::new(config.worker_id.clone()) {
            Ok(engine) => engine,
            Err(err) => {
                error!(error = %err, "probe engine init failed");
                return exit_code::CONFIG;
            }
        };

        let agent = WorkerAgent::new(
            config.clone(),
            capabilities.clone(),
            region.clone(),
            engine,
            bus,
            Arc::clone(&buffer),
            Arc::clone(&registry),
        );

        if config.health_port != 0 {
            let context = HealthContext {
                worker_id: config.worker_id.clone(),
                state: agent.state(),
                buffer: agent.buffer(),
            };
            let port = config.health_port;
            tokio::spawn(async move {
                if let Err(err) = health::serve(context, port).await {
                    warn!(error = %err, "health endpoint failed");
                }
            });
        }

        match agent.run(shutdown.child_token()).await {
            AgentExit::Shutdown => {
                info!("worker shut down");
                return exit_code::OK;
            }
            AgentExit::Reregister => {
                warn!("credentials invalidated; re-entering registration");
                continue;
            }
        }
    }
}

async fn connect_broker(url: &str) -> Result<Arc<dyn MessageBus>, BusError> {
    let mut delay = std::time::Duration::from_secs(2);
    let mut last_err = BusError::Closed;
    for attempt in 1..=BROKER_CONNECT_ATTEMPTS {
        match RedisBus::connect(url).await {
            Ok(bus) => return Ok(Arc::new(bus)),
            Err(BusError::Unauthorized) => return Err(BusError::Unauthorized),
            Err(err) => {
                warn!(attempt, error = %err, "broker connect failed");
                last_err = err;
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
    Err(last_err)
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });
}
