use axum::http::HeaderValue;
use axum::{extract::Request, middleware::Next, response::Response};
use uuid::Uuid;

pub use crate::observability::REQUEST_ID_HEADER;

/// Longest caller-supplied request id that is passed through unchanged.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Ensures every request carries a usable `x-request-id` and echoes it on the
/// response. Missing, oversized or non-printable ids are replaced with a
/// fresh UUID.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let supplied = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|s| is_usable(s))
        .map(str::to_string);

    let request_id = supplied.unwrap_or_else(|| Uuid::new_v4().to_string());

    let Ok(value) = HeaderValue::from_str(&request_id) else {
        return next.run(req).await;
    };
    req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());

    let mut response = next.run(req).await;
    response.headers_mut().insert(REQUEST_ID_HEADER, value);
    response
}

fn is_usable(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id.chars().all(|c| c.is_ascii_graphic())
}
