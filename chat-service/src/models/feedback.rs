//! User feedback on a stored message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Feedback is recorded under the id the caller supplied; `local_id` and
/// `remote_id` are enrichment filled in when the reconciler can resolve it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub feedback_id: String,

    /// Identifier exactly as submitted.
    pub message_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,

    pub is_positive: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl Feedback {
    pub fn new(message_id: impl Into<String>, is_positive: bool, content: Option<String>) -> Self {
        Self {
            feedback_id: uuid::Uuid::new_v4().to_string(),
            message_id: message_id.into(),
            local_id: None,
            remote_id: None,
            is_positive,
            content,
            created_at: Utc::now(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.remote_id.is_some()
    }
}
