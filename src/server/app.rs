use axum::{routing::get, Router};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::api::{health, prometheus_metrics};
use crate::protocol::dispatch;

use super::AppState;

pub fn create_app(state: AppState) -> Router {
    let body_limit = state.settings.server.max_body_bytes;

    Router::new()
        // Broker endpoints under the reserved prefix
        .route("/_fmq/health", get(health))
        .route("/_fmq/metrics", get(prometheus_metrics))
        // Every other path addresses a queue
        .fallback(dispatch)
        // Add middleware
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        // Add state
        .with_state(state)
}
