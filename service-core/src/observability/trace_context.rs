//! W3C Trace Context propagation for outbound HTTP calls.
//!
//! Outbound requests to collaborators carry `traceparent`/`tracestate` for the
//! current span plus the request id of the inbound call that caused them, so a
//! background continuation can still be correlated with the request.
//!
//! See: https://www.w3.org/TR/trace-context/

use opentelemetry::trace::TraceContextExt;
use reqwest::header::HeaderMap;
use std::time::{Duration, Instant};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Inject the current span's trace context and an optional request id.
pub fn inject_trace_headers(headers: &mut HeaderMap, request_id: Option<&str>) {
    let context = Span::current().context();
    let otel_span = context.span();
    let span_context = otel_span.span_context();

    if span_context.is_valid() {
        // version-trace_id-span_id-trace_flags
        let traceparent = format!(
            "00-{}-{}-{:02x}",
            span_context.trace_id(),
            span_context.span_id(),
            span_context.trace_flags().to_u8()
        );

        if let Ok(value) = traceparent.parse() {
            headers.insert(TRACEPARENT_HEADER, value);
        }

        let tracestate = span_context.trace_state().header();
        if !tracestate.is_empty()
            && let Ok(value) = tracestate.parse()
        {
            headers.insert(TRACESTATE_HEADER, value);
        }
    }

    if let Some(id) = request_id
        && let Ok(value) = id.parse()
    {
        headers.insert(REQUEST_ID_HEADER, value);
    }
}

/// Request id of an inbound call, if it carried a usable one.
pub fn extract_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// A request to a named collaborator. Trace headers are injected right
/// before sending and the call is counted under `target`.
pub struct TracedRequest {
    request: reqwest::RequestBuilder,
    target: &'static str,
}

impl TracedRequest {
    pub fn new(request: reqwest::RequestBuilder, target: &'static str) -> Self {
        Self { request, target }
    }

    pub fn json<T: serde::Serialize + ?Sized>(mut self, json: &T) -> Self {
        self.request = self.request.json(json);
        self
    }

    pub fn bearer_auth<T: std::fmt::Display>(mut self, token: T) -> Self {
        self.request = self.request.bearer_auth(token);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request = self.request.timeout(timeout);
        self
    }

    /// Send with trace context and, when known, the originating request id.
    /// Records `outbound_requests_total{target,outcome}` and the latency.
    pub async fn send(self, request_id: Option<&str>) -> Result<reqwest::Response, reqwest::Error> {
        let mut headers = HeaderMap::new();
        inject_trace_headers(&mut headers, request_id);

        let start = Instant::now();
        let result = self.request.headers(headers).send().await;

        let outcome = match &result {
            Ok(response) if response.status().is_success() => "success",
            Ok(_) => "error_status",
            Err(e) if e.is_timeout() => "timeout",
            Err(_) => "transport_error",
        };
        metrics::counter!(
            "outbound_requests_total",
            "target" => self.target,
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!("outbound_request_duration_seconds", "target" => self.target)
            .record(start.elapsed().as_secs_f64());

        result
    }
}

/// Extension trait for reqwest::Client to create traced requests.
pub trait TracedClientExt {
    fn traced_post(&self, url: &str, target: &'static str) -> TracedRequest;
}

impl TracedClientExt for reqwest::Client {
    fn traced_post(&self, url: &str, target: &'static str) -> TracedRequest {
        TracedRequest::new(self.post(url), target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_without_span_only_sets_request_id() {
        let mut headers = HeaderMap::new();
        inject_trace_headers(&mut headers, Some("req-7"));

        assert!(headers.get(TRACEPARENT_HEADER).is_none());
        assert_eq!(extract_request_id(&headers), Some("req-7".to_string()));
    }

    #[test]
    fn test_inject_without_request_id_leaves_headers_empty() {
        let mut headers = HeaderMap::new();
        inject_trace_headers(&mut headers, None);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_blank_request_id_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, "  ".parse().unwrap());
        assert_eq!(extract_request_id(&headers), None);
    }
}
