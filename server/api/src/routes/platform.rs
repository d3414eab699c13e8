use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use guardant_core::{Incident, IncidentState};
use guardant_registry::ListFilter;
use guardant_store::{get_json, keys, scan_all, set_json};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::audit;
use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, serde::Serialize)]
pub struct PlatformStats {
    pub nests: usize,
    pub services: usize,
    pub workers_total: usize,
    pub workers_pending: usize,
    pub open_incidents: usize,
}

pub async fn stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<PlatformStats>, ApiError> {
    let principal = state.admin(&headers).await?;
    principal.require_platform_admin()?;

    let nests = scan_all(state.store.as_ref(), "nest:")
        .await?
        .into_iter()
        .filter(|key| {
            key.strip_prefix("nest:")
                .map(|rest| rest.parse::<Uuid>().is_ok())
                .unwrap_or(false)
        })
        .count();
    let services = scan_all(state.store.as_ref(), "service:").await?.len();
    let workers = state.registry.list(ListFilter::All).await?;
    let workers_pending = workers.iter().filter(|w| !w.status.approved).count();

    let mut open_incidents = 0;
    for key in scan_all(state.store.as_ref(), "incidents:").await? {
        if key.ends_with(":open") {
            continue;
        }
        if let Some(incident) = get_json::<Incident>(state.store.as_ref(), &key).await? {
            if incident.is_open() {
                open_incidents += 1;
            }
        }
    }

    Ok(Json(PlatformStats {
        nests,
        services,
        workers_total: workers.len(),
        workers_pending,
        open_incidents,
    }))
}

#[derive(Debug, Deserialize)]
pub struct IncidentUpdateBody {
    pub state: IncidentState,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct IncidentScope {
    pub nest: Option<Uuid>,
}

/// Operator path through the incident state machine. Transitions are
/// monotonic; a rejected transition is a 400.
pub async fn incident_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(incident_id): Path<Uuid>,
    Query(scope): Query<IncidentScope>,
    Json(body): Json<IncidentUpdateBody>,
) -> Result<Json<Incident>, ApiError> {
    let principal = state.admin(&headers).await?;
    let nest_id = scope
        .nest
        .or(principal.nest_id)
        .ok_or(ApiError::Validation("nest is required".to_string()))?;
    principal.authorize_nest(nest_id)?;

    let key = keys::incident(nest_id, incident_id);
    let mut incident = get_json::<Incident>(state.store.as_ref(), &key)
        .await?
        .ok_or(ApiError::NotFound)?;
    let before = json!(&incident);

    if !incident.advance(
        body.state,
        body.message.clone(),
        Some(principal.user_id.clone()),
        Utc::now(),
    ) {
        return Err(ApiError::Validation(format!(
            "cannot transition from {:?} to {:?}",
            incident.state, body.state
        )));
    }
    set_json(state.store.as_ref(), &key, &incident).await?;
    if incident.state == IncidentState::Resolved {
        state
            .store
            .zrem(&keys::incidents_open(nest_id), &incident_id.to_string())
            .await?;
    }

    audit::record(
        &state,
        &principal,
        "incident.update",
        incident_id.to_string(),
        before,
        json!(&incident),
    )
    .await?;
    Ok(Json(incident))
}
