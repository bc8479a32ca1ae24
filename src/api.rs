// =============================================================================
// Operational HTTP surface — health, engine state, Prometheus metrics
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::executor::Executor;
use crate::ml::MlGate;
use crate::orders::OrderTracker;

/// Shared handles behind the API.
pub struct ApiState {
    pub executor: Arc<Executor>,
    pub gate: Arc<MlGate>,
    pub tracker: Arc<OrderTracker>,
    pub prometheus: PrometheusHandle,
}

/// Build the router with permissive CORS (tighten for production).
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/metrics", get(prometheus_metrics))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

#[derive(Serialize)]
struct StateResponse {
    engine: crate::executor::EngineSnapshot,
    ml: crate::ml::MlGateStats,
    orders: crate::orders::tracker::TrackerStats,
}

async fn full_state(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(StateResponse {
        engine: state.executor.snapshot(),
        ml: state.gate.stats(),
        orders: state.tracker.stats(),
    })
}

async fn prometheus_metrics(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    state.prometheus.render()
}
