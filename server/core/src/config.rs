use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use config::{Config, ConfigError as BuilderError, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_CONFIG_DIR: &str = "config";

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub store: StoreSection,
    pub bus: BusSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    pub observability: ObservabilitySection,
}

impl ServerConfig {
    pub fn metrics_addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        self.observability.metrics_socket_addr()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl ServerSection {
    pub fn bind_address(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    /// Redis URL backing the tenant store; `memory` selects the embedded
    /// store for single-node runs.
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusSection {
    /// Broker URL; `memory` selects the in-process bus.
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_no_coverage_ticks")]
    pub no_coverage_ticks: u32,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            no_coverage_ticks: default_no_coverage_ticks(),
        }
    }
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_no_coverage_ticks() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilitySection {
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_metrics_bind")]
    pub metrics_bind: String,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_metrics_bind() -> String {
    "127.0.0.1".into()
}

fn default_metrics_port() -> u16 {
    9100
}

impl ObservabilitySection {
    pub fn metrics_socket_addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.metrics_bind, self.metrics_port).parse()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub profile: Option<String>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub store_url: Option<String>,
    pub bus_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Builder(#[from] BuilderError),
}

impl From<std::net::AddrParseError> for ConfigError {
    fn from(err: std::net::AddrParseError) -> Self {
        ConfigError::Message(err.to_string())
    }
}

pub fn load(overrides: ConfigOverrides) -> std::result::Result<ServerConfig, ConfigError> {
    let mut builder = Config::builder();
    builder = builder.add_source(optional_file(DEFAULT_CONFIG_DIR, "default.toml"));
    builder = builder
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("store.url", "memory")?
        .set_default("bus.url", "memory")?
        .set_default("observability.log_level", "info")?;

    if let Some(profile) = overrides.profile.as_deref() {
        let profile_file = format!("{profile}.toml");
        builder = builder.add_source(optional_file(DEFAULT_CONFIG_DIR, &profile_file));
    }

    if let Some(path) = overrides.config_path {
        builder = builder.add_source(File::from(path));
    }

    builder = builder.add_source(Environment::with_prefix("GUARDANT").separator("__"));

    if let Some(host) = overrides.server_host {
        builder = builder.set_override("server.host", host)?;
    }
    if let Some(port) = overrides.server_port {
        builder = builder.set_override("server.port", port as i64)?;
    }
    if let Some(url) = overrides.store_url {
        builder = builder.set_override("store.url", url)?;
    }
    if let Some(url) = overrides.bus_url {
        builder = builder.set_override("bus.url", url)?;
    }
    if let Some(level) = overrides.log_level {
        builder = builder.set_override("observability.log_level", level)?;
    }
    if let Some(format) = overrides.log_format {
        builder = builder.set_override("observability.log_format", format)?;
    }

    Ok(builder.build()?.try_deserialize()?)
}

fn optional_file(dir: &str, name: &str) -> File<config::FileSourceFile, FileFormat> {
    File::from(Path::new(dir).join(name)).required(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_files() {
        let config = load(ConfigOverrides::default()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.store.url, "memory");
        assert_eq!(config.scheduler.tick_ms, 1000);
        assert_eq!(config.observability.log_format, "pretty");
    }

    #[test]
    fn overrides_beat_defaults() {
        let config = load(ConfigOverrides {
            server_port: Some(9000),
            store_url: Some("redis://localhost/0".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.store.url, "redis://localhost/0");
    }
}
