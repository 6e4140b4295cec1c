use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::json;

use crate::proxy::RouterState;

pub fn router(state: RouterState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/liveness", get(liveness))
        .route("/readiness", get(readiness))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health(State(state): State<RouterState>) -> Response {
    // Serving continues in degraded mode, so this stays 200; the body
    // says which mode we're in.
    let kv_healthy = state.store.is_healthy();
    axum::Json(json!({
        "status": if kv_healthy { "ok" } else { "degraded" },
        "kv": kv_healthy,
    }))
    .into_response()
}

async fn liveness() -> Response {
    (StatusCode::OK, "ok").into_response()
}

async fn readiness(State(state): State<RouterState>) -> Response {
    // Probe the backend rather than trusting the latched flag alone, so
    // readiness flips back once the store returns.
    let reachable = state.store.ping().await.is_ok();
    if reachable && state.store.is_healthy() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "kv unreachable").into_response()
    }
}

async fn metrics(State(state): State<RouterState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}
