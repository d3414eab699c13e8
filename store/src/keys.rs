//! Persisted state layout. Every live-status key is namespaced by nest id;
//! a read under one nest can never alias another nest's data.

use uuid::Uuid;

pub fn nest(id: Uuid) -> String {
    format!("nest:{id}")
}

pub fn nest_by_subdomain(subdomain: &str) -> String {
    format!("nest:subdomain:{subdomain}")
}

pub fn nest_by_email(email: &str) -> String {
    format!("nest:email:{email}")
}

pub fn service(nest_id: Uuid, service_id: Uuid) -> String {
    format!("service:{nest_id}:{service_id}")
}

pub fn service_prefix(nest_id: Uuid) -> String {
    format!("service:{nest_id}:")
}

pub fn rollup(nest_id: Uuid, service_id: Uuid) -> String {
    format!("rollup:{nest_id}:{service_id}")
}

pub fn worker_registration(worker_id: &str) -> String {
    format!("workers:registrations:{worker_id}")
}

pub const WORKER_REGISTRATION_PREFIX: &str = "workers:registrations:";
pub const WORKERS_PENDING: &str = "workers:pending";

pub fn workers_by_owner(email: &str) -> String {
    format!("workers:by_owner:{email}")
}

pub fn worker_heartbeat(worker_id: &str) -> String {
    format!("workers:heartbeat:{worker_id}")
}

pub const WORKER_HEARTBEAT_PREFIX: &str = "workers:heartbeat:";

pub fn incident(nest_id: Uuid, incident_id: Uuid) -> String {
    format!("incidents:{nest_id}:{incident_id}")
}

pub fn incidents_open(nest_id: Uuid) -> String {
    format!("incidents:{nest_id}:open")
}

/// Last received push-heartbeat for a heartbeat-type service.
pub fn service_heartbeat(nest_id: Uuid, service_id: Uuid) -> String {
    format!("heartbeat:{nest_id}:{service_id}")
}

/// SSE fan-out channel for a nest's live status.
pub fn status_channel(nest_id: Uuid) -> String {
    format!("nest:{nest_id}:status")
}

pub const STATUS_CHANNEL_PATTERN: &str = "nest:*:status";

/// Dispatcher feedback channel: the aggregator announces consumed task
/// results so in-flight tracking can clear without competing on the
/// result queue.
pub const RESULTS_SEEN_CHANNEL: &str = "results:seen";
