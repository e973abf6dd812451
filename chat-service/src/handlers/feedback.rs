use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use service_core::{error::AppError, observability::extract_request_id};

use crate::{dtos::FeedbackRequest, utils::ValidatedJson, AppState};

/// Record a rating. Accepted even when the id cannot be resolved.
pub async fn submit_feedback(
    State(state): State<AppState>,
    headers: HeaderMap,
    ValidatedJson(req): ValidatedJson<FeedbackRequest>,
) -> Result<impl IntoResponse, AppError> {
    let request_id = extract_request_id(&headers);
    let receipt = state.chat.submit_feedback(req.into(), request_id).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}
