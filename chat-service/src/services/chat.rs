//! Chat turn orchestration.
//!
//! A turn resolves the session, consults the response cache, calls the model
//! and answers. Everything after the reply exists is handed to the background
//! queue so caller latency is bounded by the model call.

use crate::config::CorrelationConfig;
use crate::error::ChatError;
use crate::models::{Conversation, Feedback, Role, SessionResolution};
use crate::services::assembler::ConversationAssembler;
use crate::services::broadcast::{ChatEvent, ChatEvents};
use crate::services::providers::{ChatProvider, GenerationRequest, ProviderError, StreamChunk};
use crate::services::reconciler::IdReconciler;
use crate::services::response_cache::{CacheKey, CachedReply, ResponseCache};
use crate::services::session_store::SessionStore;
use crate::services::store::ChatStore;
use crate::workers::{BackgroundJob, JobQueue, TurnRecord};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub session_id: Option<String>,
    pub message: String,
    pub language: Option<String>,
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub reply: String,
    pub session_id: String,
    pub conversation_id: String,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_message_id: Option<String>,
    pub new_conversation: bool,
    pub cached: bool,
}

/// Events of a streamed turn, in order: one `Start`, any number of `Delta`,
/// then `Done` or `Error`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Start {
        session_id: String,
        conversation_id: String,
        new_conversation: bool,
    },
    Delta {
        text: String,
    },
    Done(ChatReply),
    Error {
        message: String,
    },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Start { .. } => "start",
            StreamEvent::Delta { .. } => "delta",
            StreamEvent::Done(_) => "done",
            StreamEvent::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedbackSubmission {
    pub message_id: String,
    pub is_positive: bool,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackReceipt {
    pub feedback_id: String,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub resolved: bool,
    /// False when the store was unreachable.
    pub persisted: bool,
}

/// Validated turn with its session already resolved.
struct PreparedTurn {
    resolution: SessionResolution,
    message: String,
    language: String,
    attachments: Vec<String>,
    key: CacheKey,
    received_at: DateTime<Utc>,
}

impl PreparedTurn {
    fn generation_request(&self) -> GenerationRequest {
        GenerationRequest {
            prompt: self.message.clone(),
            language: self.language.clone(),
            attachments: self.attachments.clone(),
        }
    }
}

pub struct ChatService {
    sessions: Arc<SessionStore>,
    cache: Arc<ResponseCache>,
    reconciler: Arc<IdReconciler>,
    assembler: ConversationAssembler,
    store: Arc<dyn ChatStore>,
    provider: Arc<dyn ChatProvider>,
    jobs: JobQueue,
    events: ChatEvents,
    default_language: String,
}

impl ChatService {
    pub fn new(
        config: &CorrelationConfig,
        store: Arc<dyn ChatStore>,
        provider: Arc<dyn ChatProvider>,
        jobs: JobQueue,
        events: ChatEvents,
    ) -> Self {
        Self {
            sessions: Arc::new(SessionStore::new(
                store.clone(),
                config.session_timeout(),
                config.client_tag.clone(),
                config.default_language.clone(),
            )),
            cache: Arc::new(ResponseCache::new(config.response_cache_ttl())),
            reconciler: Arc::new(IdReconciler::new(store.clone())),
            assembler: ConversationAssembler::new(
                config.client_tag.clone(),
                config.default_language.clone(),
            ),
            store,
            provider,
            jobs,
            events,
            default_language: config.default_language.clone(),
        }
    }

    pub fn sessions(&self) -> Arc<SessionStore> {
        self.sessions.clone()
    }

    pub fn cache(&self) -> Arc<ResponseCache> {
        self.cache.clone()
    }

    pub fn reconciler(&self) -> Arc<IdReconciler> {
        self.reconciler.clone()
    }

    pub fn provider(&self) -> Arc<dyn ChatProvider> {
        self.provider.clone()
    }

    /// Buffered turn. Fails only on malformed input or when the model
    /// produced no reply.
    pub async fn handle_turn(
        &self,
        request: TurnRequest,
        request_id: Option<String>,
    ) -> Result<ChatReply, ChatError> {
        let prepared = self.prepare_turn(request).await?;

        if let Some(reply) = self.cached_reply(&prepared) {
            return Ok(reply);
        }

        let response = self
            .provider
            .generate(&prepared.generation_request())
            .await
            .map_err(|e| self.provider_failed(e))?;

        if response.text.trim().is_empty() {
            return Err(self.provider_failed(ProviderError::EmptyResponse));
        }

        Ok(self.finish_turn(prepared, response.text, request_id))
    }

    /// Streamed turn. Errors before the first token are returned directly;
    /// later ones arrive as [`StreamEvent::Error`].
    pub async fn stream_turn(
        self: &Arc<Self>,
        request: TurnRequest,
        request_id: Option<String>,
    ) -> Result<mpsc::Receiver<StreamEvent>, ChatError> {
        let prepared = self.prepare_turn(request).await?;
        let (tx, rx) = mpsc::channel(32);

        let start = StreamEvent::Start {
            session_id: prepared.resolution.session.session_id.clone(),
            conversation_id: prepared.resolution.session.conversation_id.clone(),
            new_conversation: prepared.resolution.is_new_conversation(),
        };

        if let Some(reply) = self.cached_reply(&prepared) {
            let events = vec![
                start,
                StreamEvent::Delta {
                    text: reply.reply.clone(),
                },
                StreamEvent::Done(reply),
            ];
            tokio::spawn(async move {
                for event in events {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            });
            return Ok(rx);
        }

        let mut stream = self
            .provider
            .generate_stream(&prepared.generation_request())
            .await
            .map_err(|e| self.provider_failed(e))?;

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let _ = tx.send(start).await;

            let mut reply = String::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(StreamChunk::Text(text)) => {
                        reply.push_str(&text);
                        // Keep consuming after a disconnect so the turn is
                        // still recorded.
                        let _ = tx.send(StreamEvent::Delta { text }).await;
                    }
                    Ok(StreamChunk::Complete { .. }) => {}
                    Err(e) => {
                        let error = service.provider_failed(e);
                        let _ = tx
                            .send(StreamEvent::Error {
                                message: error.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }

            if reply.trim().is_empty() {
                let error = service.provider_failed(ProviderError::EmptyResponse);
                let _ = tx
                    .send(StreamEvent::Error {
                        message: error.to_string(),
                    })
                    .await;
                return;
            }

            let done = service.finish_turn(prepared, reply, request_id);
            let _ = tx.send(StreamEvent::Done(done)).await;
        });

        Ok(rx)
    }

    /// Record feedback under whatever id the caller gave. Resolution through
    /// the reconciler is enrichment only.
    pub async fn submit_feedback(
        &self,
        submission: FeedbackSubmission,
        request_id: Option<String>,
    ) -> Result<FeedbackReceipt, ChatError> {
        let message_id = submission.message_id.trim().to_string();
        if message_id.is_empty() {
            return Err(ChatError::MalformedInput("message_id is empty".to_string()));
        }

        let target = self.reconciler.resolve_feedback_target(&message_id).await;

        let mut feedback = Feedback::new(
            message_id.clone(),
            submission.is_positive,
            submission.content.clone(),
        );
        if let Some(target) = &target {
            feedback.local_id = Some(target.local_id.clone());
            feedback.remote_id = Some(target.remote_id.clone());
        }

        let persisted = match self.store.insert_feedback(&feedback).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    message_id = %message_id,
                    error = %e,
                    "Failed to persist feedback"
                );
                metrics::counter!("storage_degraded_total", "operation" => "insert_feedback")
                    .increment(1);
                false
            }
        };

        let resolved = feedback.is_resolved();
        metrics::counter!("feedback_total", "resolved" => resolved.to_string()).increment(1);
        tracing::info!(
            message_id = %message_id,
            resolved,
            is_positive = submission.is_positive,
            "Feedback received"
        );

        if let Some(remote_id) = &feedback.remote_id {
            self.jobs.enqueue(BackgroundJob::ForwardFeedback {
                remote_id: remote_id.clone(),
                is_positive: feedback.is_positive,
                content: feedback.content.clone(),
                request_id,
            });
        }

        self.events.publish(ChatEvent::FeedbackReceived {
            feedback_id: feedback.feedback_id.clone(),
            message_id: message_id.clone(),
            remote_id: feedback.remote_id.clone(),
            is_positive: feedback.is_positive,
        });

        Ok(FeedbackReceipt {
            feedback_id: feedback.feedback_id,
            message_id,
            local_id: feedback.local_id,
            remote_id: feedback.remote_id,
            resolved,
            persisted,
        })
    }

    /// Normalize a legacy conversation payload and queue it for recording.
    pub fn import_conversation(
        &self,
        raw: serde_json::Value,
        request_id: Option<String>,
    ) -> Result<Conversation, ChatError> {
        let conversation = self.assembler.normalize_value(raw)?;

        tracing::info!(
            conversation_id = %conversation.id,
            session_id = %conversation.session_id,
            messages = conversation.messages.len(),
            "Importing conversation"
        );

        self.jobs.enqueue(BackgroundJob::ImportConversation {
            conversation: conversation.clone(),
            request_id,
        });

        Ok(conversation)
    }

    async fn prepare_turn(&self, request: TurnRequest) -> Result<PreparedTurn, ChatError> {
        let message = request.message.trim().to_string();
        if message.is_empty() {
            return Err(ChatError::MalformedInput("message is empty".to_string()));
        }

        let received_at = Utc::now();
        let language = request
            .language
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| self.default_language.clone());

        let resolution = self
            .sessions
            .resolve_session_at(request.session_id.as_deref(), received_at)
            .await;

        let key = CacheKey::new(
            &resolution.session.session_id,
            &message,
            &language,
            &request.attachments,
        );

        Ok(PreparedTurn {
            resolution,
            message,
            language,
            attachments: request.attachments,
            key,
            received_at,
        })
    }

    fn cached_reply(&self, prepared: &PreparedTurn) -> Option<ChatReply> {
        let cached = self.cache.get(&prepared.key)?;

        metrics::counter!("chat_cache_hits_total").increment(1);
        tracing::info!(
            session_id = %cached.session_id,
            message_id = %cached.message_id,
            "Serving reply from response cache"
        );

        Some(ChatReply {
            reply: cached.reply,
            session_id: cached.session_id,
            conversation_id: cached.conversation_id,
            message_id: cached.message_id,
            remote_message_id: cached.remote_message_id,
            new_conversation: prepared.resolution.is_new_conversation(),
            cached: true,
        })
    }

    /// Build the reply, cache it and queue the background recording. Cannot
    /// fail: the model reply already exists.
    fn finish_turn(
        &self,
        prepared: PreparedTurn,
        reply: String,
        request_id: Option<String>,
    ) -> ChatReply {
        let session = &prepared.resolution.session;
        let new_conversation = prepared.resolution.is_new_conversation();

        let conversation = match self.assembler.assemble_turn(
            session,
            &prepared.message,
            &reply,
            &prepared.language,
            prepared.received_at,
            Utc::now(),
        ) {
            Ok(conversation) => conversation,
            Err(e) => {
                tracing::error!(
                    session_id = %session.session_id,
                    error = %e,
                    "Failed to assemble turn, reply will not be recorded"
                );
                return ChatReply {
                    reply,
                    session_id: session.session_id.clone(),
                    conversation_id: session.conversation_id.clone(),
                    message_id: crate::models::message::new_message_id(),
                    remote_message_id: None,
                    new_conversation,
                    cached: false,
                };
            }
        };

        let message_id = conversation
            .messages
            .iter()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.id.clone())
            .unwrap_or_default();

        self.cache.put(
            prepared.key.clone(),
            CachedReply {
                reply: reply.clone(),
                session_id: session.session_id.clone(),
                conversation_id: session.conversation_id.clone(),
                message_id: message_id.clone(),
                remote_message_id: None,
                language: prepared.language.clone(),
            },
        );

        self.jobs.enqueue(BackgroundJob::RecordTurn(TurnRecord {
            conversation,
            cache_key: Some(prepared.key.clone()),
            new_conversation,
            request_id,
        }));

        metrics::counter!("chat_turns_total").increment(1);
        tracing::info!(
            session_id = %session.session_id,
            conversation_id = %session.conversation_id,
            message_id = %message_id,
            "Chat turn answered"
        );

        ChatReply {
            reply,
            session_id: session.session_id.clone(),
            conversation_id: session.conversation_id.clone(),
            message_id,
            remote_message_id: None,
            new_conversation,
            cached: false,
        }
    }

    fn provider_failed(&self, error: ProviderError) -> ChatError {
        tracing::warn!(
            provider = self.provider.name(),
            error = %error,
            "Model provider failed"
        );
        metrics::counter!(
            "provider_errors_total",
            "provider" => self.provider.name(),
            "kind" => error.kind()
        )
        .increment(1);
        ChatError::Provider(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::providers::MockChatProvider;
    use crate::services::store::InMemoryChatStore;
    use std::time::Duration;

    fn correlation_config() -> CorrelationConfig {
        CorrelationConfig {
            client_tag: "web".to_string(),
            default_language: "en".to_string(),
            session_timeout_secs: 900,
            response_cache_ttl_secs: 3600,
            dedup_max_entries: 1000,
            dedup_prefix_chars: 40,
            background_queue_size: 16,
        }
    }

    struct Fixture {
        service: Arc<ChatService>,
        provider: Arc<MockChatProvider>,
        store: Arc<InMemoryChatStore>,
        jobs: mpsc::Receiver<BackgroundJob>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryChatStore::new());
        let provider = Arc::new(MockChatProvider::new());
        let (queue, jobs) = JobQueue::channel(16);
        let service = Arc::new(ChatService::new(
            &correlation_config(),
            store.clone(),
            provider.clone(),
            queue,
            ChatEvents::new(16),
        ));
        Fixture {
            service,
            provider,
            store,
            jobs,
        }
    }

    fn request(session: &str, message: &str) -> TurnRequest {
        TurnRequest {
            session_id: Some(session.to_string()),
            message: message.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_turn_replies_and_queues_recording() {
        let mut f = fixture();

        let reply = f
            .service
            .handle_turn(request("s1", "hello"), Some("req-1".to_string()))
            .await
            .unwrap();

        assert_eq!(reply.reply, "Echo (en): hello");
        assert_eq!(reply.session_id, "s1");
        assert!(reply.new_conversation);
        assert!(!reply.cached);

        match f.jobs.try_recv().unwrap() {
            BackgroundJob::RecordTurn(record) => {
                assert_eq!(record.conversation.id, reply.conversation_id);
                assert_eq!(record.conversation.messages.len(), 2);
                assert_eq!(record.conversation.messages[1].id, reply.message_id);
                assert_eq!(record.request_id.as_deref(), Some("req-1"));
            }
            other => panic!("unexpected job: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_identical_resubmission_is_cache_hit() {
        let f = fixture();

        let first = f.service.handle_turn(request("s1", "Hello"), None).await.unwrap();
        let second = f
            .service
            .handle_turn(request("s1", "  hello "), None)
            .await
            .unwrap();

        assert!(second.cached);
        assert!(!second.new_conversation);
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(f.provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_message_is_malformed() {
        let f = fixture();
        let result = f.service.handle_turn(request("s1", "   "), None).await;
        assert!(matches!(result, Err(ChatError::MalformedInput(_))));
    }

    #[tokio::test]
    async fn test_provider_failure_surfaces() {
        let f = fixture();
        f.provider.set_failing(true);
        let result = f.service.handle_turn(request("s1", "hi"), None).await;
        assert!(matches!(result, Err(ChatError::Provider(_))));
    }

    #[tokio::test]
    async fn test_storage_outage_does_not_fail_turn() {
        let f = fixture();
        f.store.set_available(false);
        let reply = f.service.handle_turn(request("s1", "hi"), None).await;
        assert!(reply.is_ok());
    }

    #[tokio::test]
    async fn test_stream_turn_event_order() {
        let f = fixture();
        let mut rx = f
            .service
            .stream_turn(request("s1", "tell me"), None)
            .await
            .unwrap();

        let mut names = Vec::new();
        let mut text = String::new();
        let mut done = None;
        while let Some(event) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
        {
            names.push(event.name());
            match event {
                StreamEvent::Delta { text: t } => text.push_str(&t),
                StreamEvent::Done(reply) => done = Some(reply),
                _ => {}
            }
        }

        assert_eq!(names.first(), Some(&"start"));
        assert_eq!(names.last(), Some(&"done"));
        assert_eq!(text, "Echo (en): tell me");
        assert_eq!(done.unwrap().reply, text);
    }

    #[tokio::test]
    async fn test_unresolved_feedback_is_still_recorded() {
        let mut f = fixture();
        let receipt = f
            .service
            .submit_feedback(
                FeedbackSubmission {
                    message_id: "unknown-id".to_string(),
                    is_positive: false,
                    content: Some("meh".to_string()),
                },
                None,
            )
            .await
            .unwrap();

        assert!(!receipt.resolved);
        assert!(receipt.persisted);
        assert_eq!(f.store.find_feedback("unknown-id").await.unwrap().len(), 1);
        assert!(f.jobs.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resolved_feedback_is_forwarded() {
        let mut f = fixture();
        f.service
            .reconciler()
            .record_mapping("msg-7", "pg-42", None)
            .await;

        let receipt = f
            .service
            .submit_feedback(
                FeedbackSubmission {
                    message_id: "pg-42".to_string(),
                    is_positive: true,
                    content: None,
                },
                None,
            )
            .await
            .unwrap();

        assert!(receipt.resolved);
        assert_eq!(receipt.local_id.as_deref(), Some("msg-7"));
        assert!(matches!(
            f.jobs.try_recv().unwrap(),
            BackgroundJob::ForwardFeedback { ref remote_id, .. } if remote_id == "pg-42"
        ));
    }

    #[tokio::test]
    async fn test_import_rejects_malformed_shape() {
        let f = fixture();
        let result = f
            .service
            .import_conversation(serde_json::json!({"userMessage": "hi"}), None);
        assert!(matches!(result, Err(ChatError::MalformedInput(_))));
    }
}
