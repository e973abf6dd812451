//! Fire-and-forget event sink for live observers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    ConversationStarted {
        session_id: String,
        conversation_id: String,
        previous_conversation_id: Option<String>,
    },
    TurnRecorded {
        session_id: String,
        conversation_id: String,
        user_message_id: Option<String>,
        assistant_message_id: Option<String>,
        assistant_remote_id: Option<String>,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    FeedbackReceived {
        feedback_id: String,
        message_id: String,
        remote_id: Option<String>,
        is_positive: bool,
    },
}

impl ChatEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::ConversationStarted { .. } => "conversation_started",
            ChatEvent::TurnRecorded { .. } => "turn_recorded",
            ChatEvent::FeedbackReceived { .. } => "feedback_received",
        }
    }
}

#[derive(Clone)]
pub struct ChatEvents {
    sender: broadcast::Sender<ChatEvent>,
}

impl ChatEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to whoever is listening. Having no subscribers is not an error.
    pub fn publish(&self, event: ChatEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
