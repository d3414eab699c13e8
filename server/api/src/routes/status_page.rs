//! Public status surface. Reads are nest-scoped by construction: every
//! key touched embeds the nest id resolved from the requested subdomain,
//! so one nest's page can never surface another's data.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use guardant_core::{builtin_region, Incident, Nest, ProbeStatus, Service, ServiceRollup};
use guardant_store::{get_json, keys, scan_all};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;

const CACHE_CONTROL: &str = "public, max-age=30, stale-while-revalidate=60";
const SSE_HEARTBEAT: Duration = Duration::from_secs(20);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPageData {
    pub nest: NestInfo,
    pub services: Vec<ServiceStatus>,
    pub incidents: Vec<Incident>,
    pub maintenance: Vec<serde_json::Value>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct NestInfo {
    pub id: Uuid,
    pub name: String,
    pub subdomain: String,
    pub settings: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub status: ProbeStatus,
    pub uptime: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    pub metrics: ServiceMetrics,
    pub regions: Vec<RegionStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetrics {
    pub uptime_24h: f64,
    pub uptime_7d: f64,
    pub uptime_30d: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_response_time_24h: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionStatus {
    pub id: String,
    pub name: String,
    pub status: ProbeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
    pub last_check: DateTime<Utc>,
}

async fn resolve_nest(state: &AppState, subdomain: &str) -> Result<Nest, ApiError> {
    // Unknown subdomains 404 without distinguishing "never existed".
    let nest_id = state
        .store
        .get(&keys::nest_by_subdomain(subdomain))
        .await?
        .and_then(|raw| raw.parse::<Uuid>().ok())
        .ok_or(ApiError::NotFound)?;
    let nest = get_json::<Nest>(state.store.as_ref(), &keys::nest(nest_id))
        .await?
        .ok_or(ApiError::NotFound)?;
    if !nest.is_active {
        return Err(ApiError::NotFound);
    }
    Ok(nest)
}

fn region_display_name(region_id: &str) -> String {
    builtin_region(region_id)
        .map(|region| format!("{}, {}", region.city, region.country))
        .unwrap_or_else(|| region_id.to_string())
}

async fn build_page(state: &AppState, nest: &Nest) -> Result<StatusPageData, ApiError> {
    let mut services = Vec::new();
    for key in scan_all(state.store.as_ref(), &keys::service_prefix(nest.id)).await? {
        let Some(service) = get_json::<Service>(state.store.as_ref(), &key).await? else {
            continue;
        };
        if !service.is_active {
            continue;
        }
        let rollup = get_json::<ServiceRollup>(
            state.store.as_ref(),
            &keys::rollup(nest.id, service.id),
        )
        .await?;

        let (status, uptime, response_time, last_check, metrics, regions) = match rollup {
            Some(rollup) => (
                rollup.current_status,
                rollup.windows.h24.uptime_pct,
                rollup.current_rtt_ms(),
                rollup.latest_check(),
                ServiceMetrics {
                    uptime_24h: rollup.windows.h24.uptime_pct,
                    uptime_7d: rollup.windows.d7.uptime_pct,
                    uptime_30d: rollup.windows.d30.uptime_pct,
                    avg_response_time_24h: rollup.windows.h24.avg_rtt_ms,
                },
                rollup
                    .regions
                    .iter()
                    .map(|(region_id, region_state)| RegionStatus {
                        id: region_id.clone(),
                        name: region_display_name(region_id),
                        status: region_state.status,
                        response_time: region_state.rtt_ms,
                        last_check: region_state.started_at,
                    })
                    .collect(),
            ),
            None => (
                ProbeStatus::Up,
                100.0,
                None,
                None,
                ServiceMetrics {
                    uptime_24h: 100.0,
                    uptime_7d: 100.0,
                    uptime_30d: 100.0,
                    avg_response_time_24h: None,
                },
                Vec::new(),
            ),
        };

        services.push(ServiceStatus {
            id: service.id,
            name: service.name.clone(),
            service_type: service.service_type.to_string(),
            status,
            uptime,
            response_time,
            last_check,
            metrics,
            regions,
        });
    }
    services.sort_by(|a, b| a.name.cmp(&b.name));

    let mut incidents = Vec::new();
    for raw_id in state
        .store
        .zrange_by_score(&keys::incidents_open(nest.id), f64::MIN, f64::MAX)
        .await?
    {
        let Ok(incident_id) = raw_id.parse::<Uuid>() else {
            continue;
        };
        if let Some(incident) = get_json::<Incident>(
            state.store.as_ref(),
            &keys::incident(nest.id, incident_id),
        )
        .await?
        {
            incidents.push(incident);
        }
    }

    Ok(StatusPageData {
        nest: NestInfo {
            id: nest.id,
            name: nest.name.clone(),
            subdomain: nest.subdomain.clone(),
            settings: json!({}),
        },
        services,
        incidents,
        maintenance: Vec::new(),
        last_updated: Utc::now(),
    })
}

pub async fn show(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(subdomain): Path<String>,
) -> Result<Response, ApiError> {
    state.public_budget(&headers)?;
    let nest = resolve_nest(&state, &subdomain).await?;
    let page = build_page(&state, &nest).await?;

    let mut response = Json(page).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static(CACHE_CONTROL),
    );
    Ok(response)
}

/// Live updates: an `update` event per rollup change plus a `heartbeat`
/// event every twenty seconds.
pub async fn events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(subdomain): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state.public_budget(&headers)?;
    let nest = resolve_nest(&state, &subdomain).await?;

    let mut subscription = state.store.subscribe(&keys::status_channel(nest.id)).await?;
    let (tx, rx) = mpsc::unbounded_channel::<Event>();

    let update_tx = tx.clone();
    tokio::spawn(async move {
        while let Some((_, payload)) = subscription.recv().await {
            let event = Event::default().event("update").data(payload);
            if update_tx.send(event).is_err() {
                return;
            }
        }
    });
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SSE_HEARTBEAT);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let event = Event::default()
                .event("heartbeat")
                .data(Utc::now().to_rfc3339());
            if tx.send(event).is_err() {
                return;
            }
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Intake for heartbeat-type services: the monitored system pushes a
/// beat here and the passive probe strategy compares timestamps.
pub async fn push_heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((subdomain, service_id)): Path<(String, Uuid)>,
) -> Result<Response, ApiError> {
    state.public_budget(&headers)?;
    let nest = resolve_nest(&state, &subdomain).await?;

    let service = get_json::<Service>(
        state.store.as_ref(),
        &keys::service(nest.id, service_id),
    )
    .await?
    .ok_or(ApiError::NotFound)?;
    if !service.service_type.is_passive() {
        return Err(ApiError::Validation(
            "service does not accept push heartbeats".to_string(),
        ));
    }

    state
        .store
        .set(
            &keys::service_heartbeat(nest.id, service_id),
            &Utc::now().to_rfc3339(),
        )
        .await?;
    Ok((StatusCode::NO_CONTENT, ()).into_response())
}
