// HTTP route handlers for the solver server

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use base64::Engine;
use solver_common::types::{ExecuteRequest, TeardownRequest, UploadRequest, UploadResponse};
use solver_engine::error::Rejection;
use solver_engine::metrics;
use std::sync::Arc;
use tracing::{info, warn};

use crate::AppState;

fn rejection_status(rejection: &Rejection) -> StatusCode {
    match rejection {
        Rejection::InvalidSession(_) | Rejection::InvalidFilename(_) | Rejection::InvalidPayload(_) => {
            StatusCode::BAD_REQUEST
        }
        Rejection::QuotaExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        Rejection::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn rejected_upload(status: StatusCode, filename: String, usage_bytes: u64, reason: String) -> Response {
    (
        status,
        Json(UploadResponse {
            accepted: false,
            filename,
            bytes: 0,
            usage_bytes,
            reason: Some(reason),
        }),
    )
        .into_response()
}

/// POST /execute - Run code in a session; always 200 with a result
pub async fn execute(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExecuteRequest>,
) -> impl IntoResponse {
    let timeout = state.config.effective_timeout(payload.timeout_seconds);
    let result = state
        .coordinator
        .execute(&payload.session_id, &payload.code, timeout)
        .await;
    (StatusCode::OK, Json(result))
}

/// POST /upload - Admit a base64-encoded input file
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<UploadRequest>,
) -> Response {
    let bytes = match base64::engine::general_purpose::STANDARD.decode(payload.content.as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(session_id = %payload.session_id, error = %e, "Undecodable upload");
            let rejection = Rejection::InvalidPayload(format!("content is not valid base64: {}", e));
            return rejected_upload(StatusCode::BAD_REQUEST, payload.filename, 0, rejection.to_string());
        }
    };
    if bytes.len() > state.config.max_upload_bytes {
        return rejected_upload(
            StatusCode::PAYLOAD_TOO_LARGE,
            payload.filename,
            0,
            format!("file exceeds the {} byte upload limit", state.config.max_upload_bytes),
        );
    }

    match state
        .coordinator
        .admit_file(&payload.session_id, &payload.filename, &bytes)
        .await
    {
        Ok(admitted) => (
            StatusCode::CREATED,
            Json(UploadResponse {
                accepted: true,
                filename: admitted.filename,
                bytes: admitted.bytes,
                usage_bytes: admitted.usage_bytes,
                reason: None,
            }),
        )
            .into_response(),
        Err(rejection) => {
            info!(session_id = %payload.session_id, reason = rejection.kind(), "Upload rejected");
            let usage_bytes = match &rejection {
                Rejection::QuotaExceeded { used, .. } => *used,
                _ => 0,
            };
            rejected_upload(rejection_status(&rejection), payload.filename, usage_bytes, rejection.to_string())
        }
    }
}

/// POST /cleanup - Tear a session down; always 200
pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TeardownRequest>,
) -> impl IntoResponse {
    let response = state.coordinator.teardown(&payload.session_id).await;
    (StatusCode::OK, Json(response))
}

/// GET /sessions/{session_id}/usage - Storage usage against the quota
pub async fn usage(State(state): State<Arc<AppState>>, Path(session_id): Path<String>) -> Response {
    match state.coordinator.usage(&session_id).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(rejection) => (
            rejection_status(&rejection),
            Json(serde_json::json!({
                "error": rejection.to_string()
            })),
        )
            .into_response(),
    }
}

/// GET /health - Readiness check
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ready" })))
}

/// GET /metrics - Prometheus exposition
pub async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}
