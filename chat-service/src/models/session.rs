//! Session model: a stable client token bound to its current conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// In-process view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Client-supplied (or synthesized) token, stable across conversations.
    pub session_id: String,

    /// Current conversation; replaced on timeout rollover.
    pub conversation_id: String,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_activity: DateTime<Utc>,

    /// Conversation superseded by the most recent rollover.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_conversation_id: Option<String>,

    /// Set when the session exists only in memory because the store was
    /// unreachable; such sessions are candidates for later adoption.
    #[serde(default)]
    pub storage_degraded: bool,
}

impl Session {
    pub fn new(
        session_id: impl Into<String>,
        conversation_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            conversation_id: conversation_id.into(),
            started_at: now,
            last_activity: now,
            previous_conversation_id: None,
            storage_degraded: false,
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_activity
    }
}

/// Durable mirror of a session, one document per client token.
///
/// Dates are stored as BSON dates so the TTL index on `last_activity` can
/// expire abandoned sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,

    pub conversation_id: String,

    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub started_at: DateTime<Utc>,

    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub last_activity: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_conversation_id: Option<String>,
}

impl From<&Session> for SessionRecord {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            conversation_id: session.conversation_id.clone(),
            started_at: session.started_at,
            last_activity: session.last_activity,
            previous_conversation_id: session.previous_conversation_id.clone(),
        }
    }
}

impl From<SessionRecord> for Session {
    fn from(record: SessionRecord) -> Self {
        Self {
            session_id: record.session_id,
            conversation_id: record.conversation_id,
            started_at: record.started_at,
            last_activity: record.last_activity,
            previous_conversation_id: record.previous_conversation_id,
            storage_degraded: false,
        }
    }
}

/// How a session lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Never-seen token; brand-new session and conversation.
    Created,
    /// Existing conversation continued.
    Resumed,
    /// Idle timeout exceeded; a new conversation superseded the old one.
    RolledOver,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Created => "created",
            SessionOutcome::Resumed => "resumed",
            SessionOutcome::RolledOver => "rolled_over",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionResolution {
    pub session: Session,
    pub outcome: SessionOutcome,
}

impl SessionResolution {
    pub fn is_new_conversation(&self) -> bool {
        !matches!(self.outcome, SessionOutcome::Resumed)
    }
}
