//! GuardAnt worker agent.
//!
//! Lifecycle: detect location, register with the control plane, wait for
//! approval, then consume regional tasks and targeted commands from the
//! broker. Every probe result is written to a durable on-disk buffer
//! before acknowledgement, so broker outages lose nothing that fits the
//! buffer. Heartbeats replicate counters and points every ten seconds.

pub mod agent;
pub mod buffer;
pub mod config;
pub mod control;
pub mod geo;
pub mod health;
pub mod points;
pub mod registry_client;

pub use agent::{AgentExit, WorkerAgent};
pub use buffer::{BufferError, ResultBuffer, DEFAULT_MAX_ENTRIES};
pub use config::{WorkerCli, WorkerConfig};
