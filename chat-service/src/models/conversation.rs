//! Conversation: an ordered run of messages under one session.

use super::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Ended,
}

/// A conversation accumulates messages across request/response cycles until a
/// timeout rollover supersedes it. `messages` is strictly ascending by
/// timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(rename = "conversation_id")]
    pub id: String,

    pub session_id: String,

    pub client_tag: String,

    #[serde(default)]
    pub messages: Vec<Message>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,

    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub ended_at: Option<DateTime<Utc>>,

    pub language: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    pub status: ConversationStatus,

    /// Conversation this one superseded on timeout rollover.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_conversation_id: Option<String>,
}

impl Conversation {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        client_tag: impl Into<String>,
        language: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            client_tag: client_tag.into(),
            messages: Vec::new(),
            started_at,
            ended_at: None,
            language: language.into(),
            topic: None,
            status: ConversationStatus::Active,
            previous_conversation_id: None,
        }
    }

    /// Same conversation without its messages; used as the insert-once header.
    pub fn header(&self) -> Self {
        Self {
            messages: Vec::new(),
            ..self.clone()
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.messages
            .windows(2)
            .all(|pair| pair[0].timestamp < pair[1].timestamp)
    }
}
