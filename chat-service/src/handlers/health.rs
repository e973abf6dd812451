use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::AppState;

/// Liveness: the durable store answers.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "chat-service",
                "version": env!("CARGO_PKG_VERSION"),
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Store health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "chat-service",
                    "error": e.to_string(),
                })),
            )
        }
    }
}

/// Readiness: store and model provider both answer.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.health_check().await;
    let provider = state.chat.provider().health_check().await;

    let status = if store.is_ok() && provider.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "checks": {
                "store": if store.is_ok() { "up" } else { "down" },
                "provider": if provider.is_ok() { "up" } else { "down" },
            },
            "sessions": state.chat.sessions().len(),
            "cached_replies": state.chat.cache().len(),
            "event_subscribers": state.events.subscriber_count(),
        })),
    )
}
