//! Worker configuration: environment first, CLI flags override.

use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_HEALTH_PORT: u16 = 3099;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("management url is required (MANAGEMENT_URL or --management-url)")]
    MissingManagementUrl,
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "guardant-worker", about = "GuardAnt probing worker")]
pub struct WorkerCli {
    #[arg(long = "worker-id")]
    pub worker_id: Option<String>,
    #[arg(long = "broker-url")]
    pub broker_url: Option<String>,
    #[arg(long = "management-url")]
    pub management_url: Option<String>,
    #[arg(long)]
    pub region: Option<String>,
    #[arg(long)]
    pub concurrency: Option<usize>,
    #[arg(long = "health-port")]
    pub health_port: Option<u16>,
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
    #[arg(long = "public-ip")]
    pub public_ip: Option<String>,
    #[arg(long)]
    pub datacenter: Option<String>,
    #[arg(long = "owner-email")]
    pub owner_email: Option<String>,
    #[arg(long = "buffer-path")]
    pub buffer_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Broker URL override; normally credentials from approval supply it.
    pub broker_url: Option<String>,
    /// Control-plane base URL for registration and heartbeats.
    pub management_url: String,
    /// Fixed region; `None` enables geolocation.
    pub region: Option<String>,
    pub concurrency: Option<usize>,
    pub health_port: u16,
    pub log_level: String,
    pub public_ip: Option<String>,
    pub datacenter: Option<String>,
    pub owner_email: String,
    pub buffer_path: PathBuf,
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl WorkerConfig {
    /// Recognized environment: `WORKER_ID`, `BROKER_URL`,
    /// `BROKER_MANAGEMENT_URL`, `REGION`, `WORKER_CONCURRENCY`,
    /// `HEALTH_PORT`, `LOG_LEVEL`, `PUBLIC_IP`, `DATACENTER`,
    /// `OWNER_EMAIL`, `BUFFER_PATH`.
    pub fn load(cli: WorkerCli) -> Result<Self, ConfigError> {
        let parse_env = |name: &'static str| -> Result<Option<u64>, ConfigError> {
            match env(name) {
                Some(value) => value
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| ConfigError::Invalid { name, value }),
                None => Ok(None),
            }
        };

        let management_url = cli
            .management_url
            .or_else(|| env("BROKER_MANAGEMENT_URL"))
            .ok_or(ConfigError::MissingManagementUrl)?;

        Ok(Self {
            worker_id: cli
                .worker_id
                .or_else(|| env("WORKER_ID"))
                .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4())),
            broker_url: cli.broker_url.or_else(|| env("BROKER_URL")),
            management_url,
            region: cli.region.or_else(|| env("REGION")),
            concurrency: match cli.concurrency {
                Some(value) => Some(value),
                None => parse_env("WORKER_CONCURRENCY")?.map(|v| v as usize),
            },
            health_port: match cli.health_port {
                Some(port) => port,
                None => parse_env("HEALTH_PORT")?
                    .map(|v| v as u16)
                    .unwrap_or(DEFAULT_HEALTH_PORT),
            },
            log_level: cli
                .log_level
                .or_else(|| env("LOG_LEVEL"))
                .unwrap_or_else(|| "info".to_string()),
            public_ip: cli.public_ip.or_else(|| env("PUBLIC_IP")),
            datacenter: cli.datacenter.or_else(|| env("DATACENTER")),
            owner_email: cli
                .owner_email
                .or_else(|| env("OWNER_EMAIL"))
                .unwrap_or_else(|| "unknown@guardant.me".to_string()),
            buffer_path: cli
                .buffer_path
                .or_else(|| env("BUFFER_PATH").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("data/result-buffer.jsonl")),
        })
    }
}

/// Worker CLI exit codes.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const CONFIG: i32 = 64;
    pub const BROKER_UNREACHABLE: i32 = 69;
    pub const BUFFER_CORRUPT: i32 = 75;
    pub const UNAUTHORIZED: i32 = 77;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_and_defaults() {
        let cli = WorkerCli {
            management_url: Some("http://localhost:8080".into()),
            worker_id: Some("w-fixed".into()),
            health_port: Some(4000),
            ..Default::default()
        };
        let config = WorkerConfig::load(cli).unwrap();
        assert_eq!(config.worker_id, "w-fixed");
        assert_eq!(config.health_port, 4000);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn management_url_is_mandatory() {
        std::env::remove_var("BROKER_MANAGEMENT_URL");
        let err = WorkerConfig::load(WorkerCli::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingManagementUrl));
    }
}
