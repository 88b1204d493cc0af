//! HTTP admin surface: metrics, node listing and eviction.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use edgehub_attestation::NodeId;

use crate::hub::EdgeHub;
use crate::session::SessionInfo;

/// Build the admin router for `hub`.
pub fn admin_router(hub: Arc<EdgeHub>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/nodes", get(nodes_handler))
        .route("/nodes/{node_id}", delete(evict_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(hub)
}

async fn metrics_handler(State(hub): State<Arc<EdgeHub>>) -> Response {
    match hub.metrics().gather_text() {
        Ok(text) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], text).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn nodes_handler(State(hub): State<Arc<EdgeHub>>) -> Json<Vec<SessionInfo>> {
    Json(hub.sessions())
}

async fn evict_handler(
    State(hub): State<Arc<EdgeHub>>,
    Path(node_id): Path<String>,
) -> StatusCode {
    if hub.evict(&NodeId::from(node_id)) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn healthz_handler(State(hub): State<Arc<EdgeHub>>) -> (StatusCode, &'static str) {
    if hub.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    } else {
        (StatusCode::OK, "ok")
    }
}
