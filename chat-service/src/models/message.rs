//! Canonical chat message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who authored a message. Every legacy alias collapses to one of these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Map a role/sender/type alias onto a canonical role.
    pub fn from_alias(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "user" | "human" | "client" | "customer" | "visitor" | "me" => Some(Role::User),
            "assistant" | "bot" | "ai" | "model" | "agent" => Some(Role::Assistant),
            _ => None,
        }
    }

    /// The role expected to follow this one in an alternating exchange.
    pub fn next(&self) -> Self {
        match self {
            Role::User => Role::Assistant,
            Role::Assistant => Role::User,
        }
    }
}

/// A single message. Immutable once created except for `remote_id`, which is
/// filled in after the analytics forwarder acknowledges it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,

    pub content: String,

    pub role: Role,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    pub language: String,

    /// Identifier assigned by the analytics service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

impl Message {
    pub fn new(
        role: Role,
        content: impl Into<String>,
        language: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_message_id(),
            content: content.into(),
            role,
            timestamp,
            language: language.into(),
            remote_id: None,
        }
    }
}

pub fn new_message_id() -> String {
    format!("msg-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_aliases() {
        assert_eq!(Role::from_alias("Human"), Some(Role::User));
        assert_eq!(Role::from_alias(" bot "), Some(Role::Assistant));
        assert_eq!(Role::from_alias("model"), Some(Role::Assistant));
        assert_eq!(Role::from_alias("narrator"), None);
        assert_eq!(Role::from_alias("system"), None);
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    #[test]
    fn test_message_ids_are_unique() {
        let now = Utc::now();
        let a = Message::new(Role::User, "hi", "en", now);
        let b = Message::new(Role::User, "hi", "en", now);
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("msg-"));
    }
}
