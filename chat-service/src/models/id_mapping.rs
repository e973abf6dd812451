//! Local-to-remote message identifier mapping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Links a locally generated message id to the id the analytics service
/// assigned. Each pair is unique and lookups may key off either side.
/// Mappings are never deleted so feedback stays resolvable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdMapping {
    pub local_id: String,

    pub remote_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_snapshot: Option<String>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl IdMapping {
    pub fn new(
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
        content_snapshot: Option<String>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            remote_id: remote_id.into(),
            content_snapshot,
            created_at: Utc::now(),
        }
    }

    pub fn matches(&self, id: &str) -> bool {
        self.local_id == id || self.remote_id == id
    }
}
