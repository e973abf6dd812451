//! Durable store abstraction.
//!
//! The correlation core only needs upsert-by-key, find-by-field and
//! append-to-array semantics, so storage sits behind a trait with a MongoDB
//! implementation ([`super::ChatDb`]) and an in-memory one.

use crate::error::ChatError;
use crate::models::{Conversation, ConversationStatus, Feedback, IdMapping, Message, SessionRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn health_check(&self) -> Result<(), ChatError>;

    // Sessions

    async fn find_session(&self, session_id: &str) -> Result<Option<SessionRecord>, ChatError>;

    async fn upsert_session(&self, record: &SessionRecord) -> Result<(), ChatError>;

    async fn touch_session(
        &self,
        session_id: &str,
        last_activity: DateTime<Utc>,
    ) -> Result<(), ChatError>;

    // Conversations

    /// Insert the conversation header if absent; existing documents are left
    /// untouched.
    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), ChatError>;

    async fn find_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, ChatError>;

    async fn end_conversation(
        &self,
        conversation_id: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<(), ChatError>;

    async fn append_messages(
        &self,
        conversation_id: &str,
        messages: &[Message],
    ) -> Result<(), ChatError>;

    async fn set_message_remote_id(
        &self,
        conversation_id: &str,
        message_id: &str,
        remote_id: &str,
    ) -> Result<(), ChatError>;

    // Identifier mappings

    /// Upsert keyed by either side of the pair.
    async fn upsert_mapping(&self, mapping: &IdMapping) -> Result<(), ChatError>;

    /// Find the mapping whose local or remote id equals `id`.
    async fn find_mapping(&self, id: &str) -> Result<Option<IdMapping>, ChatError>;

    // Feedback

    async fn insert_feedback(&self, feedback: &Feedback) -> Result<(), ChatError>;

    async fn find_feedback(&self, message_id: &str) -> Result<Vec<Feedback>, ChatError>;
}

/// Process-local store for development and tests.
///
/// It can be flipped to unavailable to exercise the degradation paths.
pub struct InMemoryChatStore {
    available: AtomicBool,
    sessions: DashMap<String, SessionRecord>,
    conversations: DashMap<String, Conversation>,
    mappings: Mutex<Vec<IdMapping>>,
    feedback: Mutex<Vec<Feedback>>,
}

impl Default for InMemoryChatStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            sessions: DashMap::new(),
            conversations: DashMap::new(),
            mappings: Mutex::new(Vec::new()),
            feedback: Mutex::new(Vec::new()),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    fn ensure_available(&self) -> Result<(), ChatError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChatError::StorageUnavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> ChatError {
    ChatError::StorageUnavailable(format!("in-memory store mutex poisoned: {}", e))
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn health_check(&self) -> Result<(), ChatError> {
        self.ensure_available()
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<SessionRecord>, ChatError> {
        self.ensure_available()?;
        Ok(self.sessions.get(session_id).map(|r| r.value().clone()))
    }

    async fn upsert_session(&self, record: &SessionRecord) -> Result<(), ChatError> {
        self.ensure_available()?;
        self.sessions
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn touch_session(
        &self,
        session_id: &str,
        last_activity: DateTime<Utc>,
    ) -> Result<(), ChatError> {
        self.ensure_available()?;
        if let Some(mut record) = self.sessions.get_mut(session_id) {
            record.last_activity = last_activity;
        }
        Ok(())
    }

    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), ChatError> {
        self.ensure_available()?;
        self.conversations
            .entry(conversation.id.clone())
            .or_insert_with(|| conversation.header());
        Ok(())
    }

    async fn find_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, ChatError> {
        self.ensure_available()?;
        Ok(self
            .conversations
            .get(conversation_id)
            .map(|c| c.value().clone()))
    }

    async fn end_conversation(
        &self,
        conversation_id: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<(), ChatError> {
        self.ensure_available()?;
        if let Some(mut conversation) = self.conversations.get_mut(conversation_id) {
            conversation.status = ConversationStatus::Ended;
            conversation.ended_at = Some(ended_at);
        }
        Ok(())
    }

    async fn append_messages(
        &self,
        conversation_id: &str,
        messages: &[Message],
    ) -> Result<(), ChatError> {
        self.ensure_available()?;
        match self.conversations.get_mut(conversation_id) {
            Some(mut conversation) => {
                conversation.messages.extend_from_slice(messages);
                Ok(())
            }
            None => Err(ChatError::StorageUnavailable(format!(
                "conversation {} not found",
                conversation_id
            ))),
        }
    }

    async fn set_message_remote_id(
        &self,
        conversation_id: &str,
        message_id: &str,
        remote_id: &str,
    ) -> Result<(), ChatError> {
        self.ensure_available()?;
        if let Some(mut conversation) = self.conversations.get_mut(conversation_id) {
            if let Some(message) = conversation.messages.iter_mut().find(|m| m.id == message_id) {
                message.remote_id = Some(remote_id.to_string());
            }
        }
        Ok(())
    }

    async fn upsert_mapping(&self, mapping: &IdMapping) -> Result<(), ChatError> {
        self.ensure_available()?;
        let mut mappings = self.mappings.lock().map_err(poisoned)?;
        match mappings
            .iter_mut()
            .find(|m| m.local_id == mapping.local_id || m.remote_id == mapping.remote_id)
        {
            Some(existing) => {
                existing.local_id = mapping.local_id.clone();
                existing.remote_id = mapping.remote_id.clone();
                if mapping.content_snapshot.is_some() {
                    existing.content_snapshot = mapping.content_snapshot.clone();
                }
            }
            None => mappings.push(mapping.clone()),
        }
        Ok(())
    }

    async fn find_mapping(&self, id: &str) -> Result<Option<IdMapping>, ChatError> {
        self.ensure_available()?;
        let mappings = self.mappings.lock().map_err(poisoned)?;
        Ok(mappings.iter().find(|m| m.matches(id)).cloned())
    }

    async fn insert_feedback(&self, feedback: &Feedback) -> Result<(), ChatError> {
        self.ensure_available()?;
        self.feedback
            .lock()
            .map_err(poisoned)?
            .push(feedback.clone());
        Ok(())
    }

    async fn find_feedback(&self, message_id: &str) -> Result<Vec<Feedback>, ChatError> {
        self.ensure_available()?;
        let feedback = self.feedback.lock().map_err(poisoned)?;
        Ok(feedback
            .iter()
            .filter(|f| {
                f.message_id == message_id
                    || f.local_id.as_deref() == Some(message_id)
                    || f.remote_id.as_deref() == Some(message_id)
            })
            .cloned()
            .collect())
    }
}
