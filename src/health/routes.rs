use crate::health::HealthState;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the health router
pub(crate) fn build_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Liveness/readiness probe
async fn health(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    if state.ready() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Starting...")
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: Option<String>,
    ready: bool,
    uptime_seconds: f64,
}

/// Status report: the configured status code while ready, 503 otherwise
async fn status(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<StatusResponse>) {
    let code = if state.ready() {
        // stored codes are validated to 100..=599 on set
        StatusCode::from_u16(state.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = StatusResponse {
        status: state.status(),
        ready: state.ready(),
        uptime_seconds: state.uptime().as_secs_f64(),
    };

    (code, Json(body))
}
