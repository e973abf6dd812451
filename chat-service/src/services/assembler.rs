//! Normalization of inbound conversation shapes into [`Conversation`].
//!
//! Two legacy shapes are accepted: a message thread (`messages` array whose
//! entries name their author through `role`, `sender` or `type`, or not at
//! all) and a bare user/bot string pair.

use crate::error::ChatError;
use crate::models::{message::new_message_id, Conversation, Message, Role, Session};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawConversation {
    Thread(RawThread),
    Pair(RawPair),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawThread {
    #[serde(default, alias = "conversation_id", alias = "conversationId")]
    pub id: Option<String>,
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default, alias = "clientTag")]
    pub client_tag: Option<String>,
    pub messages: Vec<RawMessage>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPair {
    #[serde(default, alias = "userMessage", alias = "user", alias = "question")]
    pub user_message: Option<String>,
    #[serde(
        default,
        alias = "botResponse",
        alias = "bot",
        alias = "response",
        alias = "answer"
    )]
    pub bot_response: Option<String>,
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default, alias = "conversationId")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub timestamp: Option<RawTimestamp>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "text", alias = "message")]
    pub content: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub timestamp: Option<RawTimestamp>,
    #[serde(default)]
    pub language: Option<String>,
}

/// Epoch milliseconds or an RFC 3339 string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Millis(i64),
    Text(String),
}

impl RawTimestamp {
    fn parse(&self) -> Option<DateTime<Utc>> {
        match self {
            RawTimestamp::Millis(ms) => Utc.timestamp_millis_opt(*ms).single(),
            RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(text)
                .map(|ts| ts.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    text.trim()
                        .parse::<i64>()
                        .ok()
                        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationAssembler {
    client_tag: String,
    default_language: String,
}

impl ConversationAssembler {
    pub fn new(client_tag: impl Into<String>, default_language: impl Into<String>) -> Self {
        Self {
            client_tag: client_tag.into(),
            default_language: default_language.into(),
        }
    }

    /// Parse an arbitrary JSON body, then normalize it.
    pub fn normalize_value(&self, value: serde_json::Value) -> Result<Conversation, ChatError> {
        let raw: RawConversation = serde_json::from_value(value).map_err(|e| {
            ChatError::MalformedInput(format!("unrecognized conversation shape: {}", e))
        })?;
        self.normalize(raw)
    }

    pub fn normalize(&self, raw: RawConversation) -> Result<Conversation, ChatError> {
        match raw {
            RawConversation::Thread(thread) => self.normalize_thread(thread, Utc::now()),
            RawConversation::Pair(pair) => self.normalize_pair(pair, Utc::now()),
        }
    }

    /// Normalize a standalone message. Without a role hint it is taken to
    /// be from the user.
    pub fn normalize_message(&self, raw: RawMessage) -> Result<Message, ChatError> {
        let language = raw
            .language
            .clone()
            .unwrap_or_else(|| self.default_language.clone());
        let role = resolve_role(&raw, None, 0);
        let timestamp = raw
            .timestamp
            .as_ref()
            .and_then(RawTimestamp::parse)
            .unwrap_or_else(Utc::now);
        build_message(raw, role, language, timestamp, 0)
    }

    /// Canonical user/assistant pair for one chat turn in `session`'s current
    /// conversation. The assistant message is always strictly later.
    pub fn assemble_turn(
        &self,
        session: &Session,
        user_text: &str,
        bot_text: &str,
        language: &str,
        user_ts: DateTime<Utc>,
        assistant_ts: DateTime<Utc>,
    ) -> Result<Conversation, ChatError> {
        if user_text.trim().is_empty() {
            return Err(ChatError::MalformedInput("user message is empty".to_string()));
        }
        if bot_text.trim().is_empty() {
            return Err(ChatError::MalformedInput("bot response is empty".to_string()));
        }

        let assistant_ts = if assistant_ts > user_ts {
            assistant_ts
        } else {
            one_ms_after(user_ts)?
        };

        let mut conversation = Conversation::new(
            session.conversation_id.clone(),
            session.session_id.clone(),
            self.client_tag.clone(),
            language,
            session.started_at,
        );
        conversation.previous_conversation_id = session.previous_conversation_id.clone();
        conversation.messages = vec![
            Message::new(Role::User, user_text, language, user_ts),
            Message::new(Role::Assistant, bot_text, language, assistant_ts),
        ];
        Ok(conversation)
    }

    fn normalize_thread(
        &self,
        thread: RawThread,
        now: DateTime<Utc>,
    ) -> Result<Conversation, ChatError> {
        if thread.messages.is_empty() {
            return Err(ChatError::MalformedInput(
                "conversation has no messages".to_string(),
            ));
        }

        let language = thread
            .language
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| self.default_language.clone());

        let mut messages = Vec::with_capacity(thread.messages.len());
        let mut previous: Option<(Role, DateTime<Utc>)> = None;

        for (index, raw) in thread.messages.into_iter().enumerate() {
            let role = resolve_role(&raw, previous.map(|(role, _)| role), index);
            let timestamp = match raw.timestamp.as_ref() {
                Some(ts) => ts.parse().ok_or_else(|| {
                    ChatError::MalformedInput(format!("message {} has an invalid timestamp", index))
                })?,
                None => match previous {
                    Some((_, ts)) => one_ms_after(ts)?,
                    None => now,
                },
            };
            let message_language = raw.language.clone().unwrap_or_else(|| language.clone());
            let message = build_message(raw, role, message_language, timestamp, index)?;
            previous = Some((message.role, message.timestamp));
            messages.push(message);
        }

        sort_strictly_ascending(&mut messages)?;

        let started_at = messages.first().map(|m| m.timestamp).unwrap_or(now);
        let mut conversation = Conversation::new(
            thread
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(new_conversation_id),
            thread
                .session_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| "anonymous".to_string()),
            thread.client_tag.unwrap_or_else(|| self.client_tag.clone()),
            language,
            started_at,
        );
        conversation.topic = thread.topic;
        conversation.messages = messages;
        Ok(conversation)
    }

    fn normalize_pair(&self, pair: RawPair, now: DateTime<Utc>) -> Result<Conversation, ChatError> {
        let user_text = pair
            .user_message
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ChatError::MalformedInput("missing user message".to_string()))?;
        let bot_text = pair
            .bot_response
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ChatError::MalformedInput("missing bot response".to_string()))?;

        let language = pair
            .language
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| self.default_language.clone());
        let user_ts = match pair.timestamp.as_ref() {
            Some(ts) => ts.parse().ok_or_else(|| {
                ChatError::MalformedInput("pair has an invalid timestamp".to_string())
            })?,
            None => now,
        };

        let mut conversation = Conversation::new(
            pair.conversation_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(new_conversation_id),
            pair.session_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| "anonymous".to_string()),
            self.client_tag.clone(),
            language.clone(),
            user_ts,
        );
        conversation.messages = vec![
            Message::new(Role::User, user_text, language.clone(), user_ts),
            Message::new(Role::Assistant, bot_text, language, one_ms_after(user_ts)?),
        ];
        Ok(conversation)
    }
}

/// Explicit `role`, then `sender`/`type` alias, then position.
fn resolve_role(raw: &RawMessage, previous: Option<Role>, index: usize) -> Role {
    let explicit = [&raw.role, &raw.sender, &raw.kind]
        .into_iter()
        .flatten()
        .find_map(|value| Role::from_alias(value));

    if let Some(role) = explicit {
        return role;
    }

    let role = previous.map(|r| r.next()).unwrap_or(Role::User);
    tracing::warn!(
        index,
        inferred_role = role.as_str(),
        "Message has no recognizable role, inferred from position"
    );
    role
}

fn build_message(
    raw: RawMessage,
    role: Role,
    language: String,
    timestamp: DateTime<Utc>,
    index: usize,
) -> Result<Message, ChatError> {
    let content = raw
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ChatError::MalformedInput(format!("message {} has no content", index)))?;

    Ok(Message {
        id: raw
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_message_id),
        content,
        role,
        timestamp,
        language,
        remote_id: None,
    })
}

/// Stable sort by timestamp, then nudge ties forward by 1ms so the sequence
/// is strictly increasing.
fn sort_strictly_ascending(messages: &mut [Message]) -> Result<(), ChatError> {
    messages.sort_by_key(|m| m.timestamp);
    for i in 1..messages.len() {
        if messages[i].timestamp <= messages[i - 1].timestamp {
            messages[i].timestamp = one_ms_after(messages[i - 1].timestamp)?;
        }
    }
    Ok(())
}

fn one_ms_after(ts: DateTime<Utc>) -> Result<DateTime<Utc>, ChatError> {
    ts.checked_add_signed(chrono::Duration::milliseconds(1))
        .ok_or_else(|| ChatError::MalformedInput(format!("timestamp {} is out of range", ts)))
}

fn new_conversation_id() -> String {
    format!("conv_{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assembler() -> ConversationAssembler {
        ConversationAssembler::new("web", "en")
    }

    #[test]
    fn test_bare_pair_normalizes_to_two_messages() {
        let conversation = assembler()
            .normalize_value(json!({"userMessage": "hi", "botResponse": "hello"}))
            .unwrap();

        assert!(!conversation.id.is_empty());
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].role, Role::User);
        assert_eq!(conversation.messages[1].role, Role::Assistant);
        assert!(conversation.messages[0].timestamp < conversation.messages[1].timestamp);
        assert_eq!(conversation.session_id, "anonymous");
    }

    #[test]
    fn test_pair_missing_bot_text_is_malformed() {
        let result = assembler().normalize_value(json!({"user_message": "hi"}));
        assert!(matches!(result, Err(ChatError::MalformedInput(_))));
    }

    #[test]
    fn test_empty_object_is_malformed() {
        let result = assembler().normalize_value(json!({}));
        assert!(matches!(result, Err(ChatError::MalformedInput(_))));
    }

    #[test]
    fn test_role_precedence() {
        let conversation = assembler()
            .normalize_value(json!({
                "conversationId": "c1",
                "messages": [
                    {"content": "a", "role": "assistant", "sender": "user", "timestamp": 1000},
                    {"content": "b", "sender": "human", "type": "bot", "timestamp": 2000},
                    {"content": "c", "type": "ai", "timestamp": 3000},
                ]
            }))
            .unwrap();

        let roles: Vec<Role> = conversation.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::Assistant, Role::User, Role::Assistant]);
        assert_eq!(conversation.id, "c1");
    }

    #[test]
    fn test_timestamp_at_upper_bound_is_malformed() {
        let result = assembler().normalize_value(json!({
            "userMessage": "hi",
            "botResponse": "yo",
            "timestamp": 8210266876799999i64
        }));
        assert!(matches!(result, Err(ChatError::MalformedInput(_))));

        let result = assembler().normalize_value(json!({
            "messages": [
                {"content": "a", "role": "user", "timestamp": 8210266876799999i64},
                {"content": "b", "role": "assistant"},
            ]
        }));
        assert!(matches!(result, Err(ChatError::MalformedInput(_))));
    }

    #[test]
    fn test_system_message_keeps_explicit_roles_after_it() {
        let conversation = assembler()
            .normalize_value(json!({
                "messages": [
                    {"text": "be brief", "role": "system", "timestamp": 1000},
                    {"text": "q1", "role": "user", "timestamp": 2000},
                    {"text": "a1", "sender": "bot", "timestamp": 3000},
                ]
            }))
            .unwrap();

        let roles: Vec<Role> = conversation.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::User, Role::Assistant]);
    }

    #[test]
    fn test_positional_fallback_alternates() {
        let conversation = assembler()
            .normalize_value(json!({
                "messages": [
                    {"text": "q1"},
                    {"text": "a1"},
                    {"text": "q2", "role": "user"},
                    {"text": "a2"},
                ]
            }))
            .unwrap();

        let roles: Vec<Role> = conversation.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        assert!(conversation.is_ordered());
    }

    #[test]
    fn test_out_of_order_messages_sorted_stably() {
        let conversation = assembler()
            .normalize_value(json!({
                "id": "c1",
                "messages": [
                    {"content": "third", "role": "user", "timestamp": 3000},
                    {"content": "first", "role": "user", "timestamp": 1000},
                    {"content": "tie-a", "role": "assistant", "timestamp": 2000},
                    {"content": "tie-b", "role": "user", "timestamp": 2000},
                ]
            }))
            .unwrap();

        let contents: Vec<&str> = conversation
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["first", "tie-a", "tie-b", "third"]);
        assert!(conversation.is_ordered());
    }

    #[test]
    fn test_rfc3339_timestamps_accepted() {
        let conversation = assembler()
            .normalize_value(json!({
                "messages": [
                    {"content": "later", "role": "user", "timestamp": "2024-05-01T10:00:05Z"},
                    {"content": "earlier", "role": "user", "timestamp": "2024-05-01T10:00:00Z"},
                ]
            }))
            .unwrap();
        assert_eq!(conversation.messages[0].content, "earlier");
    }

    #[test]
    fn test_empty_thread_is_malformed() {
        let result = assembler().normalize_value(json!({"messages": []}));
        assert!(matches!(result, Err(ChatError::MalformedInput(_))));
    }

    #[test]
    fn test_message_without_content_is_malformed() {
        let result = assembler().normalize_value(json!({"messages": [{"role": "user"}]}));
        assert!(matches!(result, Err(ChatError::MalformedInput(_))));
    }

    #[test]
    fn test_normalize_message_defaults_to_user() {
        let message = assembler()
            .normalize_message(RawMessage {
                content: Some("hey".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(message.role, Role::User);
        assert_eq!(message.language, "en");
        assert!(message.id.starts_with("msg-"));
    }

    #[test]
    fn test_assemble_turn_orders_assistant_after_user() {
        let now = Utc::now();
        let session = Session::new("s1", "s1_1", now);
        let conversation = assembler()
            .assemble_turn(&session, "hi", "hello", "en", now, now)
            .unwrap();

        assert_eq!(conversation.id, "s1_1");
        assert_eq!(
            conversation.messages[1].timestamp - conversation.messages[0].timestamp,
            chrono::Duration::milliseconds(1)
        );
    }
}
