use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures::Stream;
use service_core::{error::AppError, observability::extract_request_id};
use std::convert::Infallible;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

use crate::{dtos::ChatRequest, services::StreamEvent, utils::ValidatedJson, AppState};

/// Answer one chat turn.
pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    ValidatedJson(req): ValidatedJson<ChatRequest>,
) -> Result<impl IntoResponse, AppError> {
    let request_id = extract_request_id(&headers);
    let reply = state.chat.handle_turn(req.into(), request_id).await?;
    Ok((StatusCode::OK, Json(reply)))
}

/// Answer one chat turn as server-sent events.
pub async fn chat_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    ValidatedJson(req): ValidatedJson<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let request_id = extract_request_id(&headers);
    let rx = state.chat.stream_turn(req.into(), request_id).await?;

    let stream = ReceiverStream::new(rx).map(|event| Ok(stream_event(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn stream_event(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.name())
        .json_data(event)
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to encode stream event");
            Event::default().event("error").data("encoding failure")
        })
}
