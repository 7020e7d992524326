use super::ApiState;
use crate::bridge::BridgeMetricsSnapshot;
use crate::controller::ControllerMetricsSnapshot;
use crate::transport::ConnectionState;
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct HealthResponse {
    /// "ok" when the transport is connected, "degraded" otherwise
    pub status: &'static str,
    pub transport: &'static str,
    pub connection: ConnectionState,
}

#[derive(Serialize)]
pub struct MetricsResponse {
    pub appliances: usize,
    pub bridge: BridgeMetricsSnapshot,
    pub controller: ControllerMetricsSnapshot,
}

pub fn create_health_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/metrics", get(metrics))
        .with_state(state)
}

/// GET /api/health - 503 while the transport is not connected
async fn health(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<HealthResponse>) {
    let connection = state.transport.connection_state();
    let (code, status) = if connection.is_connected() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(HealthResponse {
            status,
            transport: state.transport.name(),
            connection,
        }),
    )
}

/// GET /api/metrics - bridge and controller counters
async fn metrics(State(state): State<Arc<ApiState>>) -> Json<MetricsResponse> {
    let appliances = state
        .store
        .list(None)
        .await
        .map(|all| all.len())
        .unwrap_or_default();

    Json(MetricsResponse {
        appliances,
        bridge: state.bridge_metrics.snapshot(state.inbound_dropped.get()),
        controller: state.controller_metrics.snapshot(state.queue.len()),
    })
}
