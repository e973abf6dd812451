//! Deterministic provider for local runs and tests.

use super::{
    ChatProvider, FinishReason, GenerationRequest, ProviderError, ProviderResponse,
    ProviderStream, StreamChunk,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Replies with `Echo (<language>): <prompt>`; streams the same text word by
/// word. Can be switched to fail every call.
pub struct MockChatProvider {
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl Default for MockChatProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChatProvider {
    pub fn new() -> Self {
        Self {
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of generate calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reply_for(request: &GenerationRequest) -> String {
        format!("Echo ({}): {}", request.language, request.prompt)
    }

    fn check(&self) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(ProviderError::ApiError("mock provider failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<ProviderResponse, ProviderError> {
        self.check()?;

        let text = Self::reply_for(request);
        Ok(ProviderResponse {
            output_tokens: text.split_whitespace().count() as i32,
            input_tokens: request.prompt.len() as i32 / 4,
            text,
            finish_reason: FinishReason::Complete,
        })
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<ProviderStream, ProviderError> {
        self.check()?;

        let text = Self::reply_for(request);
        let words: Vec<&str> = text.split(' ').collect();
        let output_tokens = words.len() as i32;

        let mut chunks: Vec<Result<StreamChunk, ProviderError>> = words
            .iter()
            .enumerate()
            .map(|(i, word)| {
                let chunk = if i == 0 {
                    word.to_string()
                } else {
                    format!(" {}", word)
                };
                Ok(StreamChunk::Text(chunk))
            })
            .collect();
        chunks.push(Ok(StreamChunk::Complete {
            input_tokens: request.prompt.len() as i32 / 4,
            output_tokens,
            finish_reason: FinishReason::Complete,
        }));

        Ok(Box::pin(tokio_stream::iter(chunks)))
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(ProviderError::NotConfigured(
                "Mock provider set to fail".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}
