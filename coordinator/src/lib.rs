//! GuardAnt coordinator: generates, prioritises and dispatches
//! per-(service, region) probe tasks.
//!
//! Runs a one-second scheduling loop over the service catalogue, routes
//! work to regions with live eligible workers, enforces per-nest budgets,
//! and backfills synthetic results when work cannot be delivered.

pub mod catalog;
pub mod quota;
pub mod routing;
pub mod scheduler;

pub use catalog::{load_catalog, load_worker_pool, ActiveWorker, CatalogEntry, WorkerPool};
pub use quota::NestQuotas;
pub use routing::{choose_regions, estimate_service_coords, score_worker, select_worker};
pub use scheduler::{
    Coordinator, SchedulerConfig, SchedulerError, StoreHeartbeatSource, SYNTHETIC_WORKER_ID,
};
