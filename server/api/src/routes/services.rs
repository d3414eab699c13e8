use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use guardant_core::{Nest, RoutingPolicy, Service, ServiceType, TypeConfig};
use guardant_store::{get_json, keys, scan_all, set_json};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::audit;
use crate::auth::Principal;
use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct NestScope {
    pub nest: Option<Uuid>,
}

/// Resolve the nest a request acts on: explicit query first, else the
/// principal's own nest.
fn resolve_nest(principal: &Principal, scope: &NestScope) -> Result<Uuid, ApiError> {
    let nest_id = scope
        .nest
        .or(principal.nest_id)
        .ok_or(ApiError::Validation("nest is required".to_string()))?;
    principal.authorize_nest(nest_id)?;
    Ok(nest_id)
}

#[derive(Debug, Deserialize)]
pub struct CreateService {
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub type_config: Option<TypeConfig>,
    pub interval_seconds: u32,
    pub timeout_ms: u32,
    pub regions: Vec<String>,
    #[serde(default)]
    pub routing: RoutingPolicy,
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(scope): Query<NestScope>,
) -> Result<Json<Vec<Service>>, ApiError> {
    let principal = state.admin(&headers).await?;
    let nest_id = resolve_nest(&principal, &scope)?;

    let mut services = Vec::new();
    for key in scan_all(state.store.as_ref(), &keys::service_prefix(nest_id)).await? {
        if let Some(service) = get_json::<Service>(state.store.as_ref(), &key).await? {
            services.push(service);
        }
    }
    services.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(services))
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(scope): Query<NestScope>,
    Json(body): Json<CreateService>,
) -> Result<Json<Service>, ApiError> {
    let principal = state.admin(&headers).await?;
    let nest_id = resolve_nest(&principal, &scope)?;

    let nest = get_json::<Nest>(state.store.as_ref(), &keys::nest(nest_id))
        .await?
        .ok_or(ApiError::NotFound)?;
    let existing = scan_all(state.store.as_ref(), &keys::service_prefix(nest_id)).await?;
    if existing.len() as u32 >= nest.subscription.services_limit {
        return Err(ApiError::LimitReached(format!(
            "nest allows at most {} services",
            nest.subscription.services_limit
        )));
    }

    let service_type = body.service_type;
    let type_config = body
        .type_config
        .unwrap_or_else(|| TypeConfig::default_for(service_type));
    let service = Service {
        id: Uuid::new_v4(),
        nest_id,
        name: body.name,
        service_type,
        target: body.target,
        type_config,
        interval_seconds: body.interval_seconds,
        timeout_ms: body.timeout_ms,
        regions: body.regions,
        routing: body.routing,
        is_active: true,
    };
    service.validate()?;

    set_json(
        state.store.as_ref(),
        &keys::service(nest_id, service.id),
        &service,
    )
    .await?;
    audit::record(
        &state,
        &principal,
        "service.create",
        service.id.to_string(),
        json!(null),
        json!(&service),
    )
    .await?;
    Ok(Json(service))
}

#[derive(Debug, Deserialize)]
pub struct UpdateService {
    pub name: Option<String>,
    pub target: Option<String>,
    pub type_config: Option<TypeConfig>,
    pub interval_seconds: Option<u32>,
    pub timeout_ms: Option<u32>,
    pub regions: Option<Vec<String>>,
    pub routing: Option<RoutingPolicy>,
    pub is_active: Option<bool>,
}

pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(scope): Query<NestScope>,
    Json(body): Json<UpdateService>,
) -> Result<Json<Service>, ApiError> {
    let principal = state.admin(&headers).await?;
    let nest_id = resolve_nest(&principal, &scope)?;

    let key = keys::service(nest_id, id);
    let mut service = get_json::<Service>(state.store.as_ref(), &key)
        .await?
        .ok_or(ApiError::NotFound)?;
    let before = json!(&service);

    if let Some(name) = body.name {
        service.name = name;
    }
    if let Some(target) = body.target {
        service.target = target;
    }
    if let Some(type_config) = body.type_config {
        service.type_config = type_config;
    }
    if let Some(interval) = body.interval_seconds {
        service.interval_seconds = interval;
    }
    if let Some(timeout) = body.timeout_ms {
        service.timeout_ms = timeout;
    }
    if let Some(regions) = body.regions {
        service.regions = regions;
    }
    if let Some(routing) = body.routing {
        service.routing = routing;
    }
    if let Some(is_active) = body.is_active {
        service.is_active = is_active;
    }
    service.validate()?;

    set_json(state.store.as_ref(), &key, &service).await?;
    audit::record(
        &state,
        &principal,
        "service.update",
        id.to_string(),
        before,
        json!(&service),
    )
    .await?;
    Ok(Json(service))
}

/// Deleting a service also removes its rolling state.
pub async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(scope): Query<NestScope>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = state.admin(&headers).await?;
    let nest_id = resolve_nest(&principal, &scope)?;

    let key = keys::service(nest_id, id);
    let service = get_json::<Service>(state.store.as_ref(), &key)
        .await?
        .ok_or(ApiError::NotFound)?;

    state.store.del(&key).await?;
    state.store.del(&keys::rollup(nest_id, id)).await?;
    state.store.del(&keys::service_heartbeat(nest_id, id)).await?;

    audit::record(
        &state,
        &principal,
        "service.delete",
        id.to_string(),
        json!(&service),
        json!(null),
    )
    .await?;
    Ok(Json(json!({ "deleted": id })))
}
