use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use guardant_core::{
    BrokerCredentials, CommandEnvelope, CommandTarget, ControlCommand, Heartbeat,
    WorkerCapabilities, WorkerLocation, WorkerRegistration,
};
use guardant_registry::{ListFilter, RegionView};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit;
use crate::auth::bearer_token;
use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub worker_id: String,
    pub owner_email: String,
    pub version: String,
    pub location: WorkerLocation,
    #[serde(default)]
    pub capabilities: WorkerCapabilities,
    #[serde(default)]
    pub datacenter: Option<String>,
}

/// Shape the worker agent polls against.
#[derive(Debug, Serialize)]
pub struct RegistrationStateBody {
    pub approved: bool,
    pub suspended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<BrokerCredentials>,
}

impl From<&WorkerRegistration> for RegistrationStateBody {
    fn from(registration: &WorkerRegistration) -> Self {
        Self {
            approved: registration.status.approved,
            suspended: registration.status.suspended,
            // Secrets only flow to approved, unsuspended workers.
            credentials: if registration.status.approved && !registration.status.suspended {
                registration.status.credentials.clone()
            } else {
                None
            },
        }
    }
}

/// Unauthenticated: new workers have no credentials yet. Budgeted on the
/// public limiter.
pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RegisterBody>,
) -> Result<Json<RegistrationStateBody>, ApiError> {
    state.public_budget(&headers)?;
    let registration = WorkerRegistration {
        worker_id: body.worker_id,
        owner_email: body.owner_email,
        location: body.location,
        capabilities: body.capabilities,
        status: Default::default(),
        counters: Default::default(),
        registered_at: Utc::now(),
    };
    let stored = state.registry.register(registration).await?;
    Ok(Json(RegistrationStateBody::from(&stored)))
}

pub async fn registration_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(worker_id): Path<String>,
) -> Result<Json<RegistrationStateBody>, ApiError> {
    state.public_budget(&headers)?;
    let registration = state.registry.get(&worker_id).await?;
    Ok(Json(RegistrationStateBody::from(&registration)))
}

/// Worker-authenticated with the issued credential secret.
pub async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(worker_id): Path<String>,
    Json(heartbeat): Json<Heartbeat>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token = bearer_token(&headers).ok_or(ApiError::Unauthenticated)?;
    state
        .registry
        .record_heartbeat(&worker_id, token, &heartbeat)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<WorkerRegistration>>, ApiError> {
    let principal = state.admin(&headers).await?;
    principal.require_platform_admin()?;
    Ok(Json(state.registry.list(ListFilter::All).await?))
}

pub async fn pending(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<WorkerRegistration>>, ApiError> {
    let principal = state.admin(&headers).await?;
    principal.require_platform_admin()?;
    Ok(Json(state.registry.list(ListFilter::Pending).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ApproveBody {
    #[serde(default)]
    pub region: Option<String>,
}

pub async fn approve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(worker_id): Path<String>,
    body: Option<Json<ApproveBody>>,
) -> Result<Json<WorkerRegistration>, ApiError> {
    let principal = state.admin(&headers).await?;
    principal.require_platform_admin()?;

    let region = body.and_then(|Json(body)| body.region);
    let approved = state.registry.approve(&worker_id, region).await?;
    audit::record(
        &state,
        &principal,
        "worker.approve",
        &worker_id,
        json!(null),
        json!({ "region": approved.status.region }),
    )
    .await?;
    Ok(Json(approved))
}

pub async fn reject(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(worker_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = state.admin(&headers).await?;
    principal.require_platform_admin()?;
    state.registry.reject(&worker_id).await?;
    audit::record(
        &state,
        &principal,
        "worker.reject",
        &worker_id,
        json!(null),
        json!(null),
    )
    .await?;
    Ok(Json(json!({ "rejected": worker_id })))
}

pub async fn suspend(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(worker_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = state.admin(&headers).await?;
    principal.require_platform_admin()?;
    state.registry.suspend(&worker_id).await?;
    audit::record(
        &state,
        &principal,
        "worker.suspend",
        &worker_id,
        json!({ "suspended": false }),
        json!({ "suspended": true }),
    )
    .await?;
    Ok(Json(json!({ "suspended": worker_id })))
}

pub async fn resume(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(worker_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = state.admin(&headers).await?;
    principal.require_platform_admin()?;
    state.registry.resume(&worker_id).await?;
    audit::record(
        &state,
        &principal,
        "worker.resume",
        &worker_id,
        json!({ "suspended": true }),
        json!({ "suspended": false }),
    )
    .await?;
    Ok(Json(json!({ "resumed": worker_id })))
}

pub async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(worker_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = state.admin(&headers).await?;
    principal.require_platform_admin()?;
    state.registry.delete(&worker_id).await?;
    audit::record(
        &state,
        &principal,
        "worker.delete",
        &worker_id,
        json!(null),
        json!(null),
    )
    .await?;
    Ok(Json(json!({ "deleted": worker_id })))
}

#[derive(Debug, Deserialize)]
pub struct ChangeRegionBody {
    pub new_region: String,
}

pub async fn change_region(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(worker_id): Path<String>,
    Json(body): Json<ChangeRegionBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = state.admin(&headers).await?;
    principal.require_platform_admin()?;
    state
        .registry
        .change_region(&worker_id, body.new_region.clone())
        .await?;
    audit::record(
        &state,
        &principal,
        "worker.change_region",
        &worker_id,
        json!(null),
        json!({ "region": body.new_region }),
    )
    .await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct FleetUpdateBody {
    pub repo: String,
    pub branch: String,
    pub version: String,
    #[serde(default)]
    pub delay_ms: u64,
    /// Single worker target; omitted means the whole fleet.
    #[serde(default)]
    pub worker_id: Option<String>,
}

pub async fn fleet_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<FleetUpdateBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = state.admin(&headers).await?;
    principal.require_platform_admin()?;

    let target = match &body.worker_id {
        Some(worker_id) => CommandTarget::Worker(worker_id.clone()),
        None => CommandTarget::Broadcast,
    };
    let envelope = CommandEnvelope::new(
        target,
        ControlCommand::UpdateWorker {
            repo: body.repo.clone(),
            branch: body.branch.clone(),
            version: body.version.clone(),
            delay_ms: body.delay_ms,
        },
    );
    state.bus.publish_command(&envelope).await?;
    audit::record(
        &state,
        &principal,
        "worker.fleet_update",
        body.worker_id.as_deref().unwrap_or("broadcast"),
        json!(null),
        json!({ "version": body.version }),
    )
    .await?;
    Ok(Json(json!({ "command_id": envelope.id })))
}

#[derive(Debug, Default, Deserialize)]
pub struct FleetRebuildBody {
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub worker_id: Option<String>,
}

pub async fn fleet_rebuild(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<FleetRebuildBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = state.admin(&headers).await?;
    principal.require_platform_admin()?;

    let body = body.map(|Json(body)| body).unwrap_or_default();
    let target = match &body.worker_id {
        Some(worker_id) => CommandTarget::Worker(worker_id.clone()),
        None => CommandTarget::Broadcast,
    };
    let envelope = CommandEnvelope::new(
        target,
        ControlCommand::RebuildWorker {
            delay_ms: body.delay_ms,
        },
    );
    state.bus.publish_command(&envelope).await?;
    audit::record(
        &state,
        &principal,
        "worker.fleet_rebuild",
        body.worker_id.as_deref().unwrap_or("broadcast"),
        json!(null),
        json!(null),
    )
    .await?;
    Ok(Json(json!({ "command_id": envelope.id })))
}

#[derive(Debug, Serialize)]
pub struct LeaderboardEntry {
    pub worker_id: String,
    pub owner_email: String,
    pub total_points: f64,
    pub current_period_points: f64,
    pub checks_ok: u64,
    pub avg_rt_ms: f64,
}

pub async fn leaderboard(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<LeaderboardEntry>>, ApiError> {
    state.admin(&headers).await?;
    let entries = state
        .registry
        .leaderboard(50)
        .await?
        .into_iter()
        .map(|registration| LeaderboardEntry {
            worker_id: registration.worker_id,
            owner_email: registration.owner_email,
            total_points: registration.counters.total_points,
            current_period_points: registration.counters.current_period_points,
            checks_ok: registration.counters.checks_ok,
            avg_rt_ms: registration.counters.avg_rt_ms,
        })
        .collect();
    Ok(Json(entries))
}

pub async fn regions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<RegionView>>, ApiError> {
    state.admin(&headers).await?;
    Ok(Json(state.registry.regions_view().await?))
}
