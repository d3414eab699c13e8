use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use guardant_core::{nest::is_dns_safe_subdomain, Nest};
use guardant_store::{get_json, keys, set_json};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::audit;
use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateNest {
    pub subdomain: String,
    pub name: String,
    pub owner_email: String,
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateNest>,
) -> Result<Json<Nest>, ApiError> {
    let principal = state.admin(&headers).await?;
    principal.require_platform_admin()?;

    if !is_dns_safe_subdomain(&body.subdomain) {
        return Err(ApiError::Validation(format!(
            "subdomain is not a valid DNS label: {}",
            body.subdomain
        )));
    }
    if state
        .store
        .get(&keys::nest_by_subdomain(&body.subdomain))
        .await?
        .is_some()
    {
        return Err(ApiError::Validation("subdomain already taken".to_string()));
    }

    let nest = Nest::new(body.subdomain, body.name, body.owner_email);
    set_json(state.store.as_ref(), &keys::nest(nest.id), &nest).await?;
    state
        .store
        .set(&keys::nest_by_subdomain(&nest.subdomain), &nest.id.to_string())
        .await?;
    state
        .store
        .set(&keys::nest_by_email(&nest.owner_email), &nest.id.to_string())
        .await?;

    audit::record(
        &state,
        &principal,
        "nest.create",
        nest.id.to_string(),
        json!(null),
        json!(&nest),
    )
    .await?;
    Ok(Json(nest))
}

pub async fn show(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Nest>, ApiError> {
    let principal = state.admin(&headers).await?;
    principal.authorize_nest(id)?;
    get_json::<Nest>(state.store.as_ref(), &keys::nest(id))
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}
