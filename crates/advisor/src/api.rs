//! HTTP surface of the advisor daemon
//!
//! Three routes: `/healthz` lists every registered check with its readiness
//! verdict, `/readyz` is the aggregate probe, `/metrics` exposes the
//! advisor's prometheus series.

use advisor_lib::healthz::{HealthCheckResult, HealthRegistry};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

#[derive(Serialize)]
struct HealthzResponse {
    ready: bool,
    checks: BTreeMap<String, HealthCheckResult>,
}

/// Full check listing; 503 once any check turns unready
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

#[derive(Serialize)]
struct ReadyzResponse {
    ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

async fn readyz(State(registry): State<HealthRegistry>) -> impl IntoResponse {
    let checks = registry.results().await;
    let failed: Vec<String> = checks
        .iter()
        .filter(|(_, c)| !c.ready)
        .map(|(name, _)| name.clone())
        .collect();

    if failed.is_empty() {
        (
            StatusCode::OK,
            Json(ReadyzResponse {
                ready: true,
                reason: None,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyzResponse {
                ready: false,
                reason: Some(format!("checks not ready: {}", failed.join(", "))),
            }),
        )
    }
}

/// Prometheus exposition of the advisor series
async fn metrics() -> Response {
    let families = prometheus::gather();
    let mut exposition = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&families, &mut exposition) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metric encoding failed: {}", e),
        )
            .into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        exposition,
    )
        .into_response()
}

pub fn router(health_registry: HealthRegistry) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(health_registry)
}

/// Bind and serve until the process exits
pub async fn serve(port: u16, health_registry: HealthRegistry) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "advisor health and metrics api listening");

    axum::serve(listener, router(health_registry)).await?;
    Ok(())
}
