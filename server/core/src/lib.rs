//! Shared configuration loading for the API server and coordinator.

pub mod config;

pub use config::{load, ConfigError, ConfigOverrides, ServerConfig};
