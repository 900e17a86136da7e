use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

/// JSON envelope around a base64 payload is at most this much larger.
const UPLOAD_ENVELOPE_BYTES: usize = 16 * 1024;

pub fn routes(max_upload_bytes: usize) -> Router<Arc<AppState>> {
    let body_limit = max_upload_bytes.saturating_mul(4) / 3 + UPLOAD_ENVELOPE_BYTES;
    Router::new()
        .route("/execute", post(handlers::execute))
        .route("/upload", post(handlers::upload))
        .route("/cleanup", post(handlers::cleanup))
        .route("/sessions/:session_id/usage", get(handlers::usage))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(DefaultBodyLimit::max(body_limit))
}
