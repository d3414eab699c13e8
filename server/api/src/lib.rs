//! GuardAnt control-plane and public status API.
//!
//! Admin surface: nests, services, worker lifecycle, fleet commands,
//! platform stats. Public surface: per-nest status pages, the SSE stream,
//! and push-heartbeat intake. Every mutating call is audit-logged; both
//! surfaces are rate limited; public endpoints never leak the existence
//! of other nests.

pub mod audit;
pub mod auth;
pub mod error;
pub mod rate_limit;
pub mod routes;

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::Router;
use guardant_bus::MessageBus;
use guardant_observability::MetricsExporter;
use guardant_registry::WorkerRegistry;
use guardant_store::TenantStore;
use tower_http::trace::TraceLayer;

use auth::{authenticate, Principal};
use error::ApiError;
use rate_limit::{admin_key, public_key, RateLimits, ADMIN_RPM, PUBLIC_RPM};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TenantStore>,
    pub bus: Arc<dyn MessageBus>,
    pub registry: Arc<WorkerRegistry>,
    pub limits: Arc<RateLimits>,
    pub metrics: Option<MetricsExporter>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn TenantStore>,
        bus: Arc<dyn MessageBus>,
        registry: Arc<WorkerRegistry>,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            limits: Arc::new(RateLimits::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, exporter: MetricsExporter) -> Self {
        self.metrics = Some(exporter);
        self
    }

    /// Authenticate and charge the admin budget.
    pub async fn admin(&self, headers: &HeaderMap) -> Result<Principal, ApiError> {
        let principal = authenticate(self, headers).await?;
        let nest = principal
            .nest_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "platform".to_string());
        self.limits
            .check(&admin_key(&principal.user_id, &nest), ADMIN_RPM)?;
        Ok(principal)
    }

    /// Charge the public budget for a client address.
    pub fn public_budget(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let client_ip = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .unwrap_or("local")
            .trim();
        self.limits.check(&public_key(client_ip), PUBLIC_RPM)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Nests
        .route("/api/nests", post(routes::nests::create))
        .route("/api/nests/:id", get(routes::nests::show))
        // Services
        .route(
            "/api/services",
            get(routes::services::list).post(routes::services::create),
        )
        .route(
            "/api/services/:id",
            put(routes::services::update).delete(routes::services::remove),
        )
        // Worker lifecycle
        .route("/api/workers", get(routes::workers::list))
        .route("/api/workers/register", post(routes::workers::register))
        .route(
            "/api/workers/registrations/pending",
            get(routes::workers::pending),
        )
        .route(
            "/api/workers/:id/registration",
            get(routes::workers::registration_state),
        )
        .route("/api/workers/:id/heartbeat", post(routes::workers::heartbeat))
        .route("/api/workers/:id/approve", post(routes::workers::approve))
        .route("/api/workers/:id/reject", post(routes::workers::reject))
        .route("/api/workers/:id/suspend", post(routes::workers::suspend))
        .route("/api/workers/:id/resume", post(routes::workers::resume))
        .route("/api/workers/:id/delete", delete(routes::workers::remove))
        .route(
            "/api/workers/:id/change-region",
            post(routes::workers::change_region),
        )
        .route("/api/workers/update", post(routes::workers::fleet_update))
        .route("/api/workers/rebuild", post(routes::workers::fleet_rebuild))
        .route("/api/workers/leaderboard", get(routes::workers::leaderboard))
        .route("/api/workers/regions", get(routes::workers::regions))
        // Platform
        .route("/api/platform/stats", get(routes::platform::stats))
        // Incidents
        .route(
            "/api/incidents/:id/update",
            post(routes::platform::incident_update),
        )
        // Public status surface
        .route("/api/status/:subdomain", get(routes::status_page::show))
        .route(
            "/api/status/:subdomain/events",
            get(routes::status_page::events),
        )
        .route(
            "/api/heartbeat/:subdomain/:service_id",
            post(routes::status_page::push_heartbeat),
        )
        // Ambient
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(exporter) => exporter.render().into_response(),
        None => (axum::http::StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
