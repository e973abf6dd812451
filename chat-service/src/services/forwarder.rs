//! Analytics forwarder client.
//!
//! The analytics service accepts a canonical conversation and answers with one
//! remote id per submitted message, in submission order.

use crate::config::AnalyticsConfig;
use crate::error::ChatError;
use crate::models::Conversation;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::observability::TracedClientExt;
use std::time::Duration;

#[async_trait]
pub trait AnalyticsForwarder: Send + Sync {
    /// Remote ids aligned with `conversation.messages`; `None` where the
    /// service did not return one.
    async fn forward_conversation(
        &self,
        conversation: &Conversation,
        request_id: Option<&str>,
    ) -> Result<Vec<Option<String>>, ChatError>;

    async fn forward_feedback(
        &self,
        remote_id: &str,
        is_positive: bool,
        content: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<(), ChatError>;
}

pub struct HttpAnalyticsForwarder {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ForwardResponse {
    #[serde(default)]
    messages: Vec<RemoteMessage>,
    #[serde(default, alias = "messageIds")]
    message_ids: Vec<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct RemoteMessage {
    #[serde(default, alias = "_id", alias = "message_id")]
    id: Option<String>,
}

#[derive(Debug, Serialize)]
struct FeedbackPayload<'a> {
    message_id: &'a str,
    is_positive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
}

impl HttpAnalyticsForwarder {
    pub fn new(config: &AnalyticsConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("analytics client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout: config.timeout(),
        })
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        request_id: Option<&str>,
    ) -> Result<reqwest::Response, ChatError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .traced_post(&url, "analytics")
            .json(body)
            .timeout(self.timeout);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send(request_id).await.map_err(|e| {
            ChatError::ForwardingFailed(format!("POST {} failed: {}", path, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(path, status, &body));
        }

        Ok(response)
    }
}

/// Client errors other than timeouts and throttling are final.
fn status_error(path: &str, status: StatusCode, body: &str) -> ChatError {
    let message = format!("POST {} returned {}: {}", path, status, body);
    let retryable = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;

    if retryable {
        ChatError::ForwardingFailed(message)
    } else {
        ChatError::ForwardingRejected(message)
    }
}

#[async_trait]
impl AnalyticsForwarder for HttpAnalyticsForwarder {
    async fn forward_conversation(
        &self,
        conversation: &Conversation,
        request_id: Option<&str>,
    ) -> Result<Vec<Option<String>>, ChatError> {
        let response = self.post("/conversations", conversation, request_id).await?;

        let parsed: ForwardResponse = response.json().await.map_err(|e| {
            ChatError::ForwardingRejected(format!("malformed analytics response: {}", e))
        })?;

        align_remote_ids(parsed, conversation)
    }

    async fn forward_feedback(
        &self,
        remote_id: &str,
        is_positive: bool,
        content: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<(), ChatError> {
        let payload = FeedbackPayload {
            message_id: remote_id,
            is_positive,
            content,
        };
        self.post("/feedback", &payload, request_id).await?;
        Ok(())
    }
}

fn align_remote_ids(
    response: ForwardResponse,
    conversation: &Conversation,
) -> Result<Vec<Option<String>>, ChatError> {
    let mut ids: Vec<Option<String>> = if !response.messages.is_empty() {
        response.messages.into_iter().map(|m| m.id).collect()
    } else {
        response.message_ids
    };

    if ids.iter().all(Option::is_none) {
        return Err(ChatError::ForwardingRejected(
            "analytics response carried no message ids".to_string(),
        ));
    }

    let expected = conversation.messages.len();
    if ids.len() != expected {
        tracing::warn!(
            conversation_id = %conversation.id,
            expected,
            received = ids.len(),
            "Analytics returned a different number of message ids"
        );
        ids.resize(expected, None);
    }

    Ok(ids)
}
