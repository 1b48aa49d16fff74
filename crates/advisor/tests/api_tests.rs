//! Integration tests for the advisor API endpoints

use advisor_lib::healthz::{checks, HealthCheckResult, HealthCheckState, HealthRegistry};
use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Duration;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::collections::BTreeMap;
use tower::ServiceExt;

#[derive(Serialize)]
struct HealthzResponse {
    ready: bool,
    checks: BTreeMap<String, HealthCheckResult>,
}

async fn healthz(State(registry): State<HealthRegistry>) -> impl IntoResponse {
    let checks = registry.results().await;
    let ready = checks.values().all(|c| c.ready);
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(HealthzResponse { ready, checks }))
}

async fn readyz(State(registry): State<HealthRegistry>) -> impl IntoResponse {
    let checks = registry.results().await;
    if checks.values().all(|c| c.ready) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics() -> impl IntoResponse {
    let families = prometheus::gather();
    let mut exposition = Vec::new();
    TextEncoder::new().encode(&families, &mut exposition).unwrap();
    (
        [("content-type", "text/plain; charset=utf-8")],
        exposition,
    )
}

fn test_router(health_registry: HealthRegistry) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(health_registry)
}

async fn setup() -> (Router, HealthRegistry) {
    let health_registry = HealthRegistry::new();
    health_registry
        .register_heartbeat_check(
            checks::CPU_ADVISOR_UPDATE,
            Duration::seconds(60),
            HealthCheckState::Ready,
            Duration::zero(),
        )
        .await;
    (test_router(health_registry.clone()), health_registry)
}

#[tokio::test]
async fn test_healthz_ok_when_checks_ready() {
    let (router, _registry) = setup().await;

    let response = router
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_healthz_unavailable_when_check_fails() {
    let (router, registry) = setup().await;
    registry
        .update_state(
            checks::CPU_ADVISOR_UPDATE,
            HealthCheckState::NotReady,
            "tick failed",
        )
        .await;

    let response = router
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_readyz_follows_check_state() {
    let (router, registry) = setup().await;

    let response = router
        .clone()
        .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    registry
        .update_state(
            checks::CPU_ADVISOR_UPDATE,
            HealthCheckState::Failed,
            "assembly failed",
        )
        .await;
    let response = router
        .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_exposition() {
    let (router, _registry) = setup().await;

    // touch a gauge so the registry has something to expose
    let metrics_handle = advisor_lib::AdvisorMetrics::new();
    metrics_handle.observe_update_duration_ms(5.0);

    let response = router
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("cpu_advisor_update_duration"));
}
