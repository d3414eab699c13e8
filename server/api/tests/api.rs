use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use guardant_aggregator::{Aggregator, AggregatorConfig};
use guardant_api::auth::{install_token, Principal, Role};
use guardant_api::{router, AppState};
use guardant_bus::memory::InMemoryBus;
use guardant_bus::MessageBus;
use guardant_core::{Nest, ProbeResult, ProbeStatus, ProbeTask};
use guardant_registry::WorkerRegistry;
use guardant_store::memory::MemoryStore;
use guardant_store::{keys, set_json, TenantStore};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

struct Harness {
    router: Router,
    store: Arc<MemoryStore>,
    bus: Arc<InMemoryBus>,
}

async fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(InMemoryBus::new());
    let registry = Arc::new(WorkerRegistry::new(
        Arc::clone(&store) as Arc<dyn TenantStore>,
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        "redis://broker.guardant.me:6379",
    ));
    let state = AppState::new(
        Arc::clone(&store) as Arc<dyn TenantStore>,
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        registry,
    );

    install_token(
        store.as_ref(),
        "admin-token",
        &Principal {
            user_id: "root".into(),
            nest_id: None,
            role: Role::PlatformAdmin,
        },
    )
    .await
    .unwrap();

    Harness {
        router: router(state),
        store,
        bus,
    }
}

async fn seed_nest(harness: &Harness, subdomain: &str) -> Nest {
    let nest = Nest::new(subdomain, subdomain.to_uppercase(), format!("{subdomain}@example.com"));
    set_json(harness.store.as_ref(), &keys::nest(nest.id), &nest)
        .await
        .unwrap();
    harness
        .store
        .set(&keys::nest_by_subdomain(subdomain), &nest.id.to_string())
        .await
        .unwrap();

    install_token(
        harness.store.as_ref(),
        &format!("{subdomain}-token"),
        &Principal {
            user_id: format!("user-{subdomain}"),
            nest_id: Some(nest.id),
            role: Role::NestUser,
        },
    )
    .await
    .unwrap();
    nest
}

fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn register_body(worker_id: &str) -> Value {
    json!({
        "worker_id": worker_id,
        "owner_email": "ops@example.com",
        "version": "0.1.0",
        "location": {
            "city": "Frankfurt",
            "country": "DE",
            "continent": "Europe",
            "coordinates": { "lat": 50.1109, "lon": 8.6821 }
        }
    })
}

#[tokio::test]
async fn worker_approval_flow() {
    let harness = harness().await;

    // Fresh registration lands pending without credentials.
    let response = harness
        .router
        .clone()
        .oneshot(request(
            "POST",
            "/api/workers/register",
            None,
            Some(register_body("w-1")),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["approved"], json!(false));
    assert!(body.get("credentials").is_none());

    let response = harness
        .router
        .clone()
        .oneshot(request(
            "GET",
            "/api/workers/registrations/pending",
            Some("admin-token"),
            None,
        ))
        .await
        .unwrap();
    let pending = json_body(response).await;
    assert_eq!(pending.as_array().unwrap().len(), 1);

    // Approval issues credentials.
    let response = harness
        .router
        .clone()
        .oneshot(request(
            "POST",
            "/api/workers/w-1/approve",
            Some("admin-token"),
            Some(json!({ "region": "eu-central-1" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let approved = json_body(response).await;
    let password = approved["status"]["credentials"]["password"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(
        approved["status"]["credentials"]["username"],
        json!("worker-w-1")
    );

    // The worker's poll now sees credentials.
    let response = harness
        .router
        .clone()
        .oneshot(request("GET", "/api/workers/w-1/registration", None, None))
        .await
        .unwrap();
    let state = json_body(response).await;
    assert_eq!(state["approved"], json!(true));
    assert!(state["credentials"]["amqp_url"]
        .as_str()
        .unwrap()
        .contains("worker-w-1"));

    // Heartbeat with the issued secret is accepted and surfaces in the
    // regions view.
    let heartbeat = json!({
        "worker_id": "w-1",
        "version": "0.1.0",
        "region": "eu-central-1",
        "last_seen": chrono::Utc::now(),
        "checks_ok": 5,
        "checks_fail": 0,
        "total_points": 7.5,
        "current_period_points": 7.5,
        "avg_rt_ms": 42.0,
        "buffer_depth": 0,
        "connected": true
    });
    let response = harness
        .router
        .clone()
        .oneshot(request(
            "POST",
            "/api/workers/w-1/heartbeat",
            Some(&password),
            Some(heartbeat.clone()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // A bad token is rejected.
    let response = harness
        .router
        .clone()
        .oneshot(request(
            "POST",
            "/api/workers/w-1/heartbeat",
            Some("wrong-token"),
            Some(heartbeat),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = harness
        .router
        .clone()
        .oneshot(request("GET", "/api/workers/regions", Some("admin-token"), None))
        .await
        .unwrap();
    let regions = json_body(response).await;
    assert_eq!(regions[0]["region_id"], json!("eu-central-1"));
    assert_eq!(regions[0]["active_count"], json!(1));
}

#[tokio::test]
async fn cross_nest_isolation() {
    let harness = harness().await;
    let nest_a = seed_nest(&harness, "nest-a").await;
    let nest_b = seed_nest(&harness, "nest-b").await;

    // Create one service in each nest via its own token.
    for (nest, token) in [(&nest_a, "nest-a-token"), (&nest_b, "nest-b-token")] {
        let response = harness
            .router
            .clone()
            .oneshot(request(
                "POST",
                "/api/services",
                Some(token),
                Some(json!({
                    "name": format!("{}-homepage", nest.subdomain),
                    "type": "web",
                    "target": "https://example.com",
                    "interval_seconds": 60,
                    "timeout_ms": 5000,
                    "regions": ["eu-central-1"]
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Nest A's token against nest B's services is a 403.
    let response = harness
        .router
        .clone()
        .oneshot(request(
            "GET",
            &format!("/api/services?nest={}", nest_b.id),
            Some("nest-a-token"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Public status of nest B carries only nest B's services.
    let response = harness
        .router
        .clone()
        .oneshot(request("GET", "/api/status/nest-b", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CACHE_CONTROL],
        "public, max-age=30, stale-while-revalidate=60"
    );
    let page = json_body(response).await;
    assert_eq!(page["nest"]["subdomain"], json!("nest-b"));
    let services = page["services"].as_array().unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0]["name"], json!("nest-b-homepage"));

    // Unknown subdomains are indistinguishable from missing ones.
    let response = harness
        .router
        .clone()
        .oneshot(request("GET", "/api/status/no-such-nest", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_page_reflects_aggregated_results() {
    let harness = harness().await;
    let nest = seed_nest(&harness, "acme").await;

    // Create a service, then run results through the aggregator.
    let response = harness
        .router
        .clone()
        .oneshot(request(
            "POST",
            "/api/services",
            Some("acme-token"),
            Some(json!({
                "name": "homepage",
                "type": "web",
                "target": "https://example.com",
                "interval_seconds": 60,
                "timeout_ms": 5000,
                "regions": ["eu-central-1"]
            })),
        ))
        .await
        .unwrap();
    let service = json_body(response).await;
    let service_id: Uuid = service["id"].as_str().unwrap().parse().unwrap();

    let aggregator = Aggregator::new(
        Arc::clone(&harness.store) as Arc<dyn TenantStore>,
        Arc::clone(&harness.bus) as Arc<dyn MessageBus>,
        AggregatorConfig::default(),
    );
    let mut task = ProbeTask::synthetic_template();
    task.nest_id = nest.id;
    task.service_id = service_id;
    task.region = "eu-central-1".into();
    let now = chrono::Utc::now();
    let mut result = ProbeResult::for_task(&task, "w-1", now);
    result.status = ProbeStatus::Up;
    result.rtt_ms = Some(84.0);
    aggregator.process_result(&result, now).await.unwrap();

    let response = harness
        .router
        .clone()
        .oneshot(request("GET", "/api/status/acme", None, None))
        .await
        .unwrap();
    let page = json_body(response).await;
    let service = &page["services"][0];
    assert_eq!(service["status"], json!("up"));
    assert_eq!(service["metrics"]["uptime24h"], json!(100.0));
    assert_eq!(service["regions"][0]["id"], json!("eu-central-1"));
    assert_eq!(service["regions"][0]["responseTime"], json!(84.0));
}

#[tokio::test]
async fn admin_surface_requires_auth_and_role() {
    let harness = harness().await;
    seed_nest(&harness, "acme").await;

    let response = harness
        .router
        .clone()
        .oneshot(request("GET", "/api/workers", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // A nest user is not a platform admin.
    let response = harness
        .router
        .clone()
        .oneshot(request("GET", "/api/workers", Some("acme-token"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn public_rate_limit_returns_retry_after() {
    let harness = harness().await;
    seed_nest(&harness, "acme").await;

    let mut last_status = StatusCode::OK;
    let mut retry_after = None;
    for _ in 0..=600 {
        let mut req = request("GET", "/api/status/acme", None, None);
        req.headers_mut()
            .insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
        let response = harness.router.clone().oneshot(req).await.unwrap();
        last_status = response.status();
        if last_status == StatusCode::TOO_MANY_REQUESTS {
            retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            break;
        }
    }
    assert_eq!(last_status, StatusCode::TOO_MANY_REQUESTS);
    assert!(retry_after.is_some());
}

#[tokio::test]
async fn fleet_update_broadcasts_command() {
    let harness = harness().await;
    let consumer = harness.bus.consume_commands("any-worker").await.unwrap();

    let response = harness
        .router
        .clone()
        .oneshot(request(
            "POST",
            "/api/workers/update",
            Some("admin-token"),
            Some(json!({
                "repo": "guardant/guardant",
                "branch": "main",
                "version": "v0.2.0",
                "delay_ms": 500
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let envelope = consumer.next().await.unwrap().ack();
    match envelope.command {
        guardant_core::ControlCommand::UpdateWorker { version, delay_ms, .. } => {
            assert_eq!(version, "v0.2.0");
            assert_eq!(delay_ms, 500);
        }
        other => panic!("unexpected command {other:?}"),
    }
}

#[tokio::test]
async fn push_heartbeat_intake_updates_store() {
    let harness = harness().await;
    let nest = seed_nest(&harness, "beat").await;

    let response = harness
        .router
        .clone()
        .oneshot(request(
            "POST",
            "/api/services",
            Some("beat-token"),
            Some(json!({
                "name": "nightly-job",
                "type": "heartbeat",
                "type_config": { "type": "heartbeat", "expected_interval_seconds": 3600 },
                "interval_seconds": 60,
                "timeout_ms": 1000,
                "regions": ["global"]
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let service = json_body(response).await;
    let service_id = service["id"].as_str().unwrap();

    let response = harness
        .router
        .clone()
        .oneshot(request(
            "POST",
            &format!("/api/heartbeat/beat/{service_id}"),
            None,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let stored = harness
        .store
        .get(&keys::service_heartbeat(
            nest.id,
            service_id.parse().unwrap(),
        ))
        .await
        .unwrap();
    assert!(stored.is_some());
}

#[tokio::test]
async fn service_limit_enforced() {
    let harness = harness().await;
    let nest = seed_nest(&harness, "tiny").await;
    // Free tier allows five services.
    let limit = nest.subscription.services_limit;

    for i in 0..limit {
        let response = harness
            .router
            .clone()
            .oneshot(request(
                "POST",
                "/api/services",
                Some("tiny-token"),
                Some(json!({
                    "name": format!("svc-{i}"),
                    "type": "web",
                    "target": "https://example.com",
                    "interval_seconds": 60,
                    "timeout_ms": 5000,
                    "regions": ["eu-central-1"]
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = harness
        .router
        .clone()
        .oneshot(request(
            "POST",
            "/api/services",
            Some("tiny-token"),
            Some(json!({
                "name": "one-too-many",
                "type": "web",
                "target": "https://example.com",
                "interval_seconds": 60,
                "timeout_ms": 5000,
                "regions": ["eu-central-1"]
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn service_validation_rejects_bad_interval() {
    let harness = harness().await;
    seed_nest(&harness, "acme").await;

    let response = harness
        .router
        .clone()
        .oneshot(request(
            "POST",
            "/api/services",
            Some("acme-token"),
            Some(json!({
                "name": "too-fast",
                "type": "web",
                "target": "https://example.com",
                "interval_seconds": 5,
                "timeout_ms": 1000,
                "regions": ["eu-central-1"]
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn registration_accepts_network_detail() {
    let harness = harness().await;
    let mut body = register_body("w-geo");
    body["location"]["asn"] = json!(3320);
    body["location"]["isp"] = json!("Example Carrier");
    let response = harness
        .router
        .clone()
        .oneshot(request("POST", "/api/workers/register", None, Some(body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
