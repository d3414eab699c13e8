//! GuardAnt core domain model.
//!
//! Shared leaf crate consumed by every service in the workspace:
//! - Tenant ("nest") and service catalogue entities with validation.
//! - The probing wire types: tasks, results, error kinds.
//! - Worker fleet entities: registrations, capabilities, heartbeats.
//! - Derived state: rollups and incidents.
//! - Control commands and the points accounting table.
//!
//! Types here are plain data plus invariant checks; all I/O lives in the
//! bus, store and service crates.

pub mod command;
pub mod incident;
pub mod nest;
pub mod points;
pub mod region;
pub mod result;
pub mod rollup;
pub mod service;
pub mod task;
pub mod worker;

pub use command::{CommandEnvelope, CommandTarget, ControlCommand};
pub use incident::{Incident, IncidentState, IncidentUpdate, Severity};
pub use nest::{Nest, Subscription, Tier};
pub use region::{builtin_catalogue, builtin_region, derive_region_id, GeoPoint, Region};
pub use result::{ErrorKind, ProbeFailure, ProbeResult, ProbeStatus, Sample};
pub use rollup::{RegionState, RollupWindows, ServiceRollup, WindowStats};
pub use service::{
    GithubConfig, HeartbeatConfig, KeywordConfig, PingConfig, PortConfig, RegionStrategy,
    RoutingPolicy, Service, ServiceType, ServiceValidationError, TcpConfig, TypeConfig,
    UptimeApiConfig, WebConfig,
};
pub use task::{ProbeTask, ResultSeen};
pub use worker::{
    BrokerCredentials, Heartbeat, WorkerCapabilities, WorkerCounters, WorkerFeatures,
    WorkerLimits, WorkerLocation, WorkerRegistration, WorkerStatus,
};
