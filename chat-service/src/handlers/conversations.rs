use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use service_core::{error::AppError, observability::extract_request_id};

use crate::AppState;

/// Import a conversation in any of the accepted legacy shapes.
pub async fn import_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(raw): Json<serde_json::Value>,
) -> Result<impl IntoResponse, AppError> {
    let request_id = extract_request_id(&headers);
    let conversation = state.chat.import_conversation(raw, request_id)?;

    let message_ids: Vec<&str> = conversation.messages.iter().map(|m| m.id.as_str()).collect();
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "conversation_id": conversation.id,
            "session_id": conversation.session_id,
            "message_count": conversation.messages.len(),
            "message_ids": message_ids,
        })),
    ))
}
