//! Background continuation of a chat turn.
//!
//! The HTTP path answers as soon as the model reply exists. Dedup and
//! persistence happen here one job at a time so turns of a conversation are
//! stored in order; forwarding, id reconciliation, back-fill and broadcast
//! then run on tracked tasks with bounded concurrency.

use crate::error::ChatError;
use crate::models::{Conversation, Message, Role};
use crate::services::broadcast::{ChatEvent, ChatEvents};
use crate::services::dedup::{ForwardLedger, MessageDeduplicator};
use crate::services::forwarder::AnalyticsForwarder;
use crate::services::reconciler::IdReconciler;
use crate::services::response_cache::{CacheKey, ResponseCache};
use crate::services::store::ChatStore;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const SNAPSHOT_CHARS: usize = 200;
const MAX_CONCURRENT_FORWARDS: usize = 4;
const FORWARD_DRAIN_GRACE: Duration = Duration::from_secs(15);

/// A completed turn waiting to be recorded.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    /// Session's conversation carrying only this turn's two messages.
    pub conversation: Conversation,
    pub cache_key: Option<CacheKey>,
    pub new_conversation: bool,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum BackgroundJob {
    RecordTurn(TurnRecord),
    ImportConversation {
        conversation: Conversation,
        request_id: Option<String>,
    },
    ForwardFeedback {
        remote_id: String,
        is_positive: bool,
        content: Option<String>,
        request_id: Option<String>,
    },
}

impl BackgroundJob {
    pub fn kind(&self) -> &'static str {
        match self {
            BackgroundJob::RecordTurn(_) => "record_turn",
            BackgroundJob::ImportConversation { .. } => "import_conversation",
            BackgroundJob::ForwardFeedback { .. } => "forward_feedback",
        }
    }
}

/// Result of recording a conversation. A duplicate is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Persisted {
        /// False when the store was unreachable.
        stored: bool,
    },
    AlreadyHandled,
}

impl PersistOutcome {
    fn label(&self) -> &'static str {
        match self {
            PersistOutcome::Persisted { stored: true } => "persisted",
            PersistOutcome::Persisted { stored: false } => "degraded",
            PersistOutcome::AlreadyHandled => "duplicate",
        }
    }
}

/// Producer side of the bounded background queue.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<BackgroundJob>,
}

impl JobQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BackgroundJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Never blocks. Returns `false` when the job was dropped.
    pub fn enqueue(&self, job: BackgroundJob) -> bool {
        let kind = job.kind();
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(kind, "Background queue full, dropping job");
                metrics::counter!("background_jobs_total", "kind" => kind, "outcome" => "dropped")
                    .increment(1);
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!(kind, "Background queue closed, dropping job");
                metrics::counter!("background_jobs_total", "kind" => kind, "outcome" => "dropped")
                    .increment(1);
                false
            }
        }
    }
}

pub struct TurnRecorder {
    store: Arc<dyn ChatStore>,
    dedup: Arc<MessageDeduplicator>,
    forwarding: Forwarding,
    tasks: TaskTracker,
}

/// Forwarding half of a recorded job. Runs on its own tasks so a slow or
/// failing analytics service never holds up persistence.
#[derive(Clone)]
struct Forwarding {
    store: Arc<dyn ChatStore>,
    reconciler: Arc<IdReconciler>,
    cache: Arc<ResponseCache>,
    events: ChatEvents,
    ledger: Arc<ForwardLedger>,
    forwarder: Option<Arc<dyn AnalyticsForwarder>>,
    retry_max_elapsed: Duration,
    permits: Arc<Semaphore>,
}

impl TurnRecorder {
    pub fn new(
        store: Arc<dyn ChatStore>,
        reconciler: Arc<IdReconciler>,
        cache: Arc<ResponseCache>,
        events: ChatEvents,
        dedup: Arc<MessageDeduplicator>,
        ledger: Arc<ForwardLedger>,
    ) -> Self {
        Self {
            store: store.clone(),
            dedup,
            forwarding: Forwarding {
                store,
                reconciler,
                cache,
                events,
                ledger,
                forwarder: None,
                retry_max_elapsed: Duration::ZERO,
                permits: Arc::new(Semaphore::new(MAX_CONCURRENT_FORWARDS)),
            },
            tasks: TaskTracker::new(),
        }
    }

    pub fn with_forwarder(
        mut self,
        forwarder: Arc<dyn AnalyticsForwarder>,
        retry_max_elapsed: Duration,
    ) -> Self {
        self.forwarding.forwarder = Some(forwarder);
        self.forwarding.retry_max_elapsed = retry_max_elapsed;
        self
    }

    /// Consume jobs until cancelled, then drain what is already queued and
    /// give in-flight forwards one retry window to finish.
    pub async fn run(self, mut jobs: mpsc::Receiver<BackgroundJob>, shutdown: CancellationToken) {
        tracing::info!("Turn recorder started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Turn recorder shutting down");
                    break;
                }
                job = jobs.recv() => {
                    match job {
                        Some(job) => self.process(job).await,
                        None => {
                            tracing::info!("Job channel closed, turn recorder exiting");
                            break;
                        }
                    }
                }
            }
        }

        jobs.close();
        let mut drained = 0usize;
        while let Ok(job) = jobs.try_recv() {
            self.process(job).await;
            drained += 1;
        }

        let grace = self.forwarding.retry_max_elapsed + FORWARD_DRAIN_GRACE;
        if tokio::time::timeout(grace, self.settle()).await.is_err() {
            tracing::warn!(
                pending = self.tasks.len(),
                "Abandoning forwards still in flight at shutdown"
            );
        }
        tracing::info!(drained, "Turn recorder stopped");
    }

    /// Wait for every forward spawned so far.
    pub async fn settle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    pub async fn process(&self, job: BackgroundJob) {
        let kind = job.kind();
        let outcome = match job {
            BackgroundJob::RecordTurn(record) => self.record_turn(record).await.label(),
            BackgroundJob::ImportConversation {
                conversation,
                request_id,
            } => {
                self.record_conversation(conversation, None, request_id)
                    .await
                    .label()
            }
            BackgroundJob::ForwardFeedback {
                remote_id,
                is_positive,
                content,
                request_id,
            } => {
                let forwarding = self.forwarding.clone();
                self.tasks.spawn(async move {
                    forwarding
                        .forward_feedback(
                            &remote_id,
                            is_positive,
                            content.as_deref(),
                            request_id.as_deref(),
                        )
                        .await;
                });
                "dispatched"
            }
        };

        metrics::counter!("background_jobs_total", "kind" => kind, "outcome" => outcome)
            .increment(1);
    }

    async fn record_turn(&self, record: TurnRecord) -> PersistOutcome {
        if record.new_conversation {
            self.forwarding.events.publish(ChatEvent::ConversationStarted {
                session_id: record.conversation.session_id.clone(),
                conversation_id: record.conversation.id.clone(),
                previous_conversation_id: record.conversation.previous_conversation_id.clone(),
            });
        }

        self.record_conversation(record.conversation, record.cache_key, record.request_id)
            .await
    }

    /// Dedup and persist one conversation fragment, then hand it to a
    /// forwarding task that reconciles ids, back-fills and broadcasts.
    pub async fn record_conversation(
        &self,
        conversation: Conversation,
        cache_key: Option<CacheKey>,
        request_id: Option<String>,
    ) -> PersistOutcome {
        let user = last_with_role(&conversation, Role::User);
        let assistant = last_with_role(&conversation, Role::Assistant);

        if !self.dedup.should_process(
            &conversation.id,
            user.map(|m| m.content.as_str()).unwrap_or_default(),
            assistant.map(|m| m.content.as_str()).unwrap_or_default(),
        ) {
            tracing::info!(
                conversation_id = %conversation.id,
                "Message pair already handled, skipping"
            );
            return PersistOutcome::AlreadyHandled;
        }

        let stored = match self.persist(&conversation).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation.id,
                    error = %e,
                    "Failed to persist conversation, continuing without storage"
                );
                metrics::counter!("storage_degraded_total", "operation" => "record_turn")
                    .increment(1);
                false
            }
        };

        tracing::info!(
            conversation_id = %conversation.id,
            messages = conversation.messages.len(),
            stored,
            "Recorded conversation messages"
        );

        let forwarding = self.forwarding.clone();
        self.tasks.spawn(async move {
            forwarding
                .complete(&conversation, cache_key.as_ref(), stored, request_id.as_deref())
                .await;
        });

        PersistOutcome::Persisted { stored }
    }

    async fn persist(&self, conversation: &Conversation) -> Result<(), ChatError> {
        self.store.create_conversation(conversation).await?;
        self.store
            .append_messages(&conversation.id, &conversation.messages)
            .await
    }
}

impl Forwarding {
    /// Forward, reconcile, back-fill and broadcast. Returns the remote ids
    /// aligned with `conversation.messages`.
    async fn complete(
        &self,
        conversation: &Conversation,
        cache_key: Option<&CacheKey>,
        stored: bool,
        request_id: Option<&str>,
    ) -> Vec<Option<String>> {
        let user = last_with_role(conversation, Role::User);
        let assistant = last_with_role(conversation, Role::Assistant);

        let remote_ids = self.forward(conversation, assistant, request_id).await;

        for (message, remote_id) in conversation.messages.iter().zip(&remote_ids) {
            let Some(remote_id) = remote_id else {
                continue;
            };

            self.reconciler
                .record_mapping(&message.id, remote_id, Some(snapshot(&message.content)))
                .await;

            if stored {
                if let Err(e) = self
                    .store
                    .set_message_remote_id(&conversation.id, &message.id, remote_id)
                    .await
                {
                    tracing::warn!(
                        message_id = %message.id,
                        error = %e,
                        "Failed to store remote id on message"
                    );
                }
            }
        }

        let assistant_remote_id = assistant.and_then(|a| remote_id_of(conversation, &remote_ids, a));

        if let (Some(key), Some(assistant), Some(remote_id)) =
            (cache_key, assistant, assistant_remote_id.as_deref())
        {
            if !self.cache.backfill_remote_id(key, &assistant.id, remote_id) {
                tracing::debug!(
                    conversation_id = %conversation.id,
                    message_id = %assistant.id,
                    "Cached reply evicted or replaced, skipping remote id back-fill"
                );
            }
        }

        self.events.publish(ChatEvent::TurnRecorded {
            session_id: conversation.session_id.clone(),
            conversation_id: conversation.id.clone(),
            user_message_id: user.map(|m| m.id.clone()),
            assistant_message_id: assistant.map(|m| m.id.clone()),
            assistant_remote_id,
            timestamp: assistant
                .or(user)
                .map(|m| m.timestamp)
                .unwrap_or(conversation.started_at),
        });

        remote_ids
    }

    /// Remote ids aligned with `conversation.messages`, all `None` when
    /// forwarding is disabled or failed.
    async fn forward(
        &self,
        conversation: &Conversation,
        assistant: Option<&Message>,
        request_id: Option<&str>,
    ) -> Vec<Option<String>> {
        let none = vec![None; conversation.messages.len()];
        let Some(forwarder) = &self.forwarder else {
            return none;
        };

        let Ok(_permit) = self.permits.acquire().await else {
            return none;
        };

        let signature = assistant.map(|m| ForwardLedger::signature(&m.content, m.timestamp));

        if let (Some(signature), Some(assistant)) = (&signature, assistant) {
            if let Some(remote_id) = self.ledger.has_been_forwarded(signature) {
                tracing::info!(
                    conversation_id = %conversation.id,
                    message_id = %assistant.id,
                    remote_id = %remote_id,
                    "Assistant message already forwarded, reusing remote id"
                );
                return conversation
                    .messages
                    .iter()
                    .map(|m| (m.id == assistant.id).then(|| remote_id.clone()))
                    .collect();
            }
        }

        let result = retry(self.policy(), || async {
            forwarder
                .forward_conversation(conversation, request_id)
                .await
                .map_err(|e| {
                    tracing::debug!(
                        conversation_id = %conversation.id,
                        error = %e,
                        "Forward attempt failed"
                    );
                    classify(e)
                })
        })
        .await;

        match result {
            Ok(remote_ids) => {
                if let (Some(signature), Some(assistant)) = (signature, assistant) {
                    if let Some(remote_id) = remote_id_of(conversation, &remote_ids, assistant) {
                        self.ledger.record(signature, remote_id);
                    }
                }
                remote_ids
            }
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation.id,
                    error = %e,
                    "Forwarding to analytics failed, continuing without remote ids"
                );
                metrics::counter!("forwarding_failures_total").increment(1);
                none
            }
        }
    }

    async fn forward_feedback(
        &self,
        remote_id: &str,
        is_positive: bool,
        content: Option<&str>,
        request_id: Option<&str>,
    ) -> &'static str {
        let Some(forwarder) = &self.forwarder else {
            return "skipped";
        };

        let Ok(_permit) = self.permits.acquire().await else {
            return "skipped";
        };

        let result = retry(self.policy(), || async {
            forwarder
                .forward_feedback(remote_id, is_positive, content, request_id)
                .await
                .map_err(classify)
        })
        .await;

        match result {
            Ok(()) => {
                tracing::info!(remote_id = %remote_id, "Forwarded feedback");
                "forwarded"
            }
            Err(e) => {
                tracing::warn!(remote_id = %remote_id, error = %e, "Failed to forward feedback");
                metrics::counter!("forwarding_failures_total").increment(1);
                "failed"
            }
        }
    }

    fn policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_elapsed_time: Some(self.retry_max_elapsed),
            ..Default::default()
        }
    }
}

fn classify(error: ChatError) -> backoff::Error<ChatError> {
    if error.is_transient() {
        backoff::Error::transient(error)
    } else {
        backoff::Error::permanent(error)
    }
}

fn remote_id_of(
    conversation: &Conversation,
    remote_ids: &[Option<String>],
    message: &Message,
) -> Option<String> {
    conversation
        .messages
        .iter()
        .position(|m| m.id == message.id)
        .and_then(|idx| remote_ids.get(idx).cloned().flatten())
}

fn last_with_role(conversation: &Conversation, role: Role) -> Option<&Message> {
    conversation.messages.iter().rev().find(|m| m.role == role)
}

fn snapshot(content: &str) -> String {
    content.chars().take(SNAPSHOT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Session;
    use crate::services::assembler::ConversationAssembler;
    use crate::services::response_cache::CachedReply;
    use crate::services::store::InMemoryChatStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        Answer,
        Unavailable,
        Rejected,
        Hang,
    }

    /// Answers with `pg-<n>-<i>` ids, or misbehaves as told.
    struct CountingForwarder {
        calls: AtomicUsize,
        mode: Mode,
    }

    #[async_trait]
    impl AnalyticsForwarder for CountingForwarder {
        async fn forward_conversation(
            &self,
            conversation: &Conversation,
            _request_id: Option<&str>,
        ) -> Result<Vec<Option<String>>, ChatError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                Mode::Answer => Ok((0..conversation.messages.len())
                    .map(|i| Some(format!("pg-{}-{}", call, i)))
                    .collect()),
                Mode::Unavailable => Err(ChatError::ForwardingFailed("status 503".to_string())),
                Mode::Rejected => Err(ChatError::ForwardingRejected("status 400".to_string())),
                Mode::Hang => std::future::pending().await,
            }
        }

        async fn forward_feedback(
            &self,
            _remote_id: &str,
            _is_positive: bool,
            _content: Option<&str>,
            _request_id: Option<&str>,
        ) -> Result<(), ChatError> {
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<InMemoryChatStore>,
        reconciler: Arc<IdReconciler>,
        cache: Arc<ResponseCache>,
        forwarder: Arc<CountingForwarder>,
        recorder: TurnRecorder,
    }

    fn fixture_with(mode: Mode, retry_max_elapsed: Duration) -> Fixture {
        let store = Arc::new(InMemoryChatStore::new());
        let reconciler = Arc::new(IdReconciler::new(store.clone()));
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(3600)));
        let forwarder = Arc::new(CountingForwarder {
            calls: AtomicUsize::new(0),
            mode,
        });
        let recorder = TurnRecorder::new(
            store.clone(),
            reconciler.clone(),
            cache.clone(),
            ChatEvents::new(16),
            Arc::new(MessageDeduplicator::new(40, 1000, Duration::from_secs(3600))),
            Arc::new(ForwardLedger::new(Duration::from_secs(3600))),
        )
        .with_forwarder(forwarder.clone(), retry_max_elapsed);

        Fixture {
            store,
            reconciler,
            cache,
            forwarder,
            recorder,
        }
    }

    fn fixture(mode: Mode) -> Fixture {
        fixture_with(mode, Duration::ZERO)
    }

    fn turn(user: &str, bot: &str) -> Conversation {
        let now = Utc::now();
        let session = Session::new("s1", "s1_1", now);
        ConversationAssembler::new("web", "en")
            .assemble_turn(&session, user, bot, "en", now, now)
            .unwrap()
    }

    fn cached(message_id: &str) -> CachedReply {
        CachedReply {
            reply: "hello".to_string(),
            session_id: "s1".to_string(),
            conversation_id: "s1_1".to_string(),
            message_id: message_id.to_string(),
            remote_message_id: None,
            language: "en".to_string(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_pair_recorded_once() {
        let f = fixture(Mode::Answer);
        let conversation = turn("hi", "hello");

        let first = f
            .recorder
            .record_conversation(conversation.clone(), None, None)
            .await;
        let second = f.recorder.record_conversation(conversation, None, None).await;
        f.recorder.settle().await;

        assert_eq!(first, PersistOutcome::Persisted { stored: true });
        assert_eq!(second, PersistOutcome::AlreadyHandled);
        assert_eq!(f.forwarder.calls.load(Ordering::SeqCst), 1);

        let stored = f.store.find_conversation("s1_1").await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_remote_ids_reconciled_and_backfilled() {
        let f = fixture(Mode::Answer);
        let conversation = turn("hi", "hello");
        let assistant_id = conversation.messages[1].id.clone();
        let key = CacheKey::new("s1", "hi", "en", &[]);
        f.cache.put(key.clone(), cached(&assistant_id));

        f.recorder
            .record_conversation(conversation, Some(key.clone()), None)
            .await;
        f.recorder.settle().await;

        let target = f.reconciler.resolve_feedback_target("pg-0-1").await.unwrap();
        assert_eq!(target.local_id, assistant_id);
        assert_eq!(
            f.cache.get(&key).unwrap().remote_message_id.as_deref(),
            Some("pg-0-1")
        );
        let stored = f.store.find_conversation("s1_1").await.unwrap().unwrap();
        assert_eq!(stored.messages[1].remote_id.as_deref(), Some("pg-0-1"));
    }

    #[tokio::test]
    async fn test_backfill_leaves_newer_cached_turn_alone() {
        let f = fixture(Mode::Answer);
        let conversation = turn("hi", "hello");
        let key = CacheKey::new("s1", "hi", "en", &[]);
        f.cache.put(key.clone(), cached("msg-newer"));

        f.recorder
            .record_conversation(conversation, Some(key.clone()), None)
            .await;
        f.recorder.settle().await;

        let entry = f.cache.get(&key).unwrap();
        assert_eq!(entry.message_id, "msg-newer");
        assert_eq!(entry.remote_message_id, None);
    }

    #[tokio::test]
    async fn test_forward_gate_reuses_remote_id() {
        let f = fixture(Mode::Answer);
        let conversation = turn("hi", "hello");
        let forwarding = &f.recorder.forwarding;
        let first = forwarding
            .forward(&conversation, conversation.messages.get(1), None)
            .await;
        let second = forwarding
            .forward(&conversation, conversation.messages.get(1), None)
            .await;

        assert_eq!(f.forwarder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first[1], second[1]);
        assert_eq!(second[0], None);
    }

    #[tokio::test]
    async fn test_forwarding_failure_degrades_quietly() {
        let f = fixture(Mode::Unavailable);
        let conversation = turn("hi", "hello");

        let outcome = f.recorder.record_conversation(conversation, None, None).await;
        f.recorder.settle().await;

        assert_eq!(outcome, PersistOutcome::Persisted { stored: true });
        assert!(f.reconciler.is_empty());
        let stored = f.store.find_conversation("s1_1").await.unwrap().unwrap();
        assert!(stored.messages.iter().all(|m| m.remote_id.is_none()));
    }

    #[tokio::test]
    async fn test_rejected_forward_is_not_retried() {
        let f = fixture_with(Mode::Rejected, Duration::from_secs(5));
        let conversation = turn("hi", "hello");

        let ids = f
            .recorder
            .forwarding
            .forward(&conversation, conversation.messages.get(1), None)
            .await;

        assert_eq!(ids, vec![None, None]);
        assert_eq!(f.forwarder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persistence_does_not_wait_for_forwarding() {
        let f = fixture_with(Mode::Hang, Duration::from_secs(30));

        for (user, bot) in [("a", "b"), ("c", "d"), ("e", "f")] {
            let outcome = tokio::time::timeout(
                Duration::from_secs(1),
                f.recorder.record_conversation(turn(user, bot), None, None),
            )
            .await
            .expect("persistence blocked behind forwarding");
            assert_eq!(outcome, PersistOutcome::Persisted { stored: true });
        }

        let stored = f.store.find_conversation("s1_1").await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 6);
    }

    #[tokio::test]
    async fn test_storage_outage_still_forwards() {
        let f = fixture(Mode::Answer);
        f.store.set_available(false);
        let conversation = turn("hi", "hello");

        let outcome = f.recorder.record_conversation(conversation, None, None).await;
        f.recorder.settle().await;

        assert_eq!(outcome, PersistOutcome::Persisted { stored: false });
        assert_eq!(f.forwarder.calls.load(Ordering::SeqCst), 1);
        // Mapping kept in memory for feedback.
        assert!(f.reconciler.resolve_feedback_target("pg-0-0").await.is_some());
    }

    #[tokio::test]
    async fn test_run_drains_queue_on_shutdown() {
        let f = fixture(Mode::Answer);
        let (queue, rx) = JobQueue::channel(8);
        assert!(queue.enqueue(BackgroundJob::ImportConversation {
            conversation: turn("a", "b"),
            request_id: None,
        }));
        assert!(queue.enqueue(BackgroundJob::ImportConversation {
            conversation: turn("c", "d"),
            request_id: None,
        }));

        let token = CancellationToken::new();
        token.cancel();
        f.recorder.run(rx, token).await;

        let stored = f.store.find_conversation("s1_1").await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 4);
        assert_eq!(f.forwarder.calls.load(Ordering::SeqCst), 2);
        assert!(f.reconciler.resolve_feedback_target("pg-1-1").await.is_some());
    }

    #[test]
    fn test_full_queue_drops_job() {
        let (queue, _rx) = JobQueue::channel(1);
        let job = BackgroundJob::ForwardFeedback {
            remote_id: "pg-1".to_string(),
            is_positive: true,
            content: None,
            request_id: None,
        };
        assert!(queue.enqueue(job.clone()));
        assert!(!queue.enqueue(job));
    }
}
