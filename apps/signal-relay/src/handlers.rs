use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::warn;

use crate::metrics;
use crate::session::SessionKey;
use crate::websocket::RelayState;

/// Health check endpoint
pub async fn health_check(State(state): State<RelayState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.registry.len(),
    }))
}

/// Stored negotiation record for one session key.
pub async fn get_session_record(
    State(state): State<RelayState>,
    Path((room, peer)): Path<(String, String)>,
) -> Response {
    let key = SessionKey::new(room, peer);
    match state.signaling.persistence().fetch(&key.to_string()).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        )
            .into_response(),
        Err(err) => {
            warn!(session = %key, error = %err, "failed to read session record");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

pub async fn prometheus_metrics() -> String {
    metrics::export_prometheus()
}
