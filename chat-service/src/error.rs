//! Failure taxonomy of the correlation core.

use crate::services::providers::ProviderError;
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Durable store unreachable. Callers degrade to in-memory state.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Analytics call failed or answered with something unusable.
    #[error("forwarding failed: {0}")]
    ForwardingFailed(String),

    /// Analytics refused the payload outright. Resending it cannot succeed.
    #[error("forwarding rejected: {0}")]
    ForwardingRejected(String),

    /// Input the assembler cannot turn into a canonical conversation.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

impl ChatError {
    /// Whether the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::StorageUnavailable(_) | ChatError::ForwardingFailed(_))
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::MalformedInput(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            ChatError::Provider(e) => AppError::BadGateway(e.to_string()),
            ChatError::StorageUnavailable(_) => AppError::ServiceUnavailable,
            ChatError::ForwardingFailed(msg) | ChatError::ForwardingRejected(msg) => {
                AppError::BadGateway(msg)
            }
        }
    }
}
