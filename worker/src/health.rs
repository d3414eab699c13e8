//! Local health endpoint exposed on `HEALTH_PORT`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::agent::AgentState;
use crate::buffer::ResultBuffer;

#[derive(Clone)]
pub struct HealthContext {
    pub worker_id: String,
    pub state: Arc<AgentState>,
    pub buffer: Arc<ResultBuffer>,
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    worker_id: String,
    connected: bool,
    suspended: bool,
    inflight: usize,
    buffer_depth: usize,
    buffer_drops: u64,
    checks_ok: u64,
    checks_fail: u64,
}

pub fn router(context: HealthContext) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(context)
}

async fn healthz(State(context): State<HealthContext>) -> Json<HealthReport> {
    let connected = context.state.connected.load(Ordering::Relaxed);
    Json(HealthReport {
        status: if connected { "ok" } else { "degraded" },
        worker_id: context.worker_id.clone(),
        connected,
        suspended: context.state.suspended.load(Ordering::Relaxed),
        inflight: context.state.inflight.load(Ordering::Relaxed),
        buffer_depth: context.buffer.depth(),
        buffer_drops: context.buffer.drop_count(),
        checks_ok: context.state.checks_ok.load(Ordering::Relaxed),
        checks_fail: context.state.checks_fail.load(Ordering::Relaxed),
    })
}

pub async fn serve(context: HealthContext, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, router(context)).await?;
    Ok(())
}
