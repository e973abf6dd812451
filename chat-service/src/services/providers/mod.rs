//! Language-model provider abstraction.
//!
//! The chat turn treats the model as an opaque collaborator: one prompt in,
//! one reply (or a token stream) out.

pub mod gemini;
pub mod mock;

use async_trait::async_trait;
use std::pin::Pin;
use thiserror::Error;
use tokio_stream::Stream;

pub use gemini::{GeminiChatProvider, GeminiConfig};
pub use mock::MockChatProvider;

/// Error type for provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Content filtered")]
    ContentFiltered,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Provider returned an empty reply")]
    EmptyResponse,
}

impl ProviderError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::NotConfigured(_) => "not_configured",
            ProviderError::ApiError(_) => "api_error",
            ProviderError::RateLimited => "rate_limited",
            ProviderError::ContentFiltered => "content_filtered",
            ProviderError::NetworkError(_) => "network_error",
            ProviderError::EmptyResponse => "empty_response",
        }
    }
}

/// One chat prompt.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,

    /// Language the reply should be written in.
    pub language: String,

    /// Attachment descriptors (names or URLs) sent along as context.
    pub attachments: Vec<String>,
}

/// Buffered provider reply.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub finish_reason: FinishReason,
}

/// Reason why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Complete,
    Length,
    ContentFilter,
}

impl FinishReason {
    fn from_gemini(reason: Option<&str>) -> Self {
        match reason {
            Some("MAX_TOKENS") => FinishReason::Length,
            Some("SAFETY") => FinishReason::ContentFilter,
            _ => FinishReason::Complete,
        }
    }
}

/// Stream chunk for streaming responses.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Text(String),

    /// Final chunk with usage stats.
    Complete {
        input_tokens: i32,
        output_tokens: i32,
        finish_reason: FinishReason,
    },
}

/// Type alias for provider streams.
pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name for logs and metrics.
    fn name(&self) -> &'static str;

    async fn generate(&self, request: &GenerationRequest) -> Result<ProviderResponse, ProviderError>;

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<ProviderStream, ProviderError>;

    async fn health_check(&self) -> Result<(), ProviderError>;
}
