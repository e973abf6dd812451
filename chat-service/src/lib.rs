pub mod config;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
pub mod utils;
pub mod workers;

use axum::{
    http::{header, HeaderName, Method},
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use service_core::middleware::{metrics::metrics_middleware, tracing::request_id_middleware};
use service_core::observability::REQUEST_ID_HEADER;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::ChatConfig;
use crate::services::{ChatEvents, ChatService, ChatStore};

#[derive(Clone)]
pub struct AppState {
    pub config: ChatConfig,
    pub store: Arc<dyn ChatStore>,
    pub chat: Arc<ChatService>,
    pub events: ChatEvents,
    /// Cancelled when the server starts shutting down. Long-lived streams
    /// end on it so graceful shutdown can complete.
    pub shutdown: CancellationToken,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route("/chat", post(handlers::chat::chat))
        .route("/chat/stream", post(handlers::chat::chat_stream))
        .route("/feedback", post(handlers::feedback::submit_feedback))
        .route(
            "/conversations",
            post(handlers::conversations::import_conversation),
        )
        .route("/events", get(handlers::events::events))
        .with_state(state)
        .layer(from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    header::CONTENT_TYPE,
                    HeaderName::from_static(REQUEST_ID_HEADER),
                ]),
        )
}
