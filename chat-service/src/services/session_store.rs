//! Session resolution with idle-timeout conversation rollover.
//!
//! Sessions live in a process-local cache backed by the durable store. The
//! store is never allowed to fail a lookup: when it is unreachable the
//! session is served from memory and tagged `storage_degraded`.

use crate::error::ChatError;
use crate::models::{Conversation, Session, SessionOutcome, SessionRecord, SessionResolution};
use crate::services::store::ChatStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

const TOKEN_SUFFIX_LEN: usize = 9;

pub struct SessionStore {
    store: Arc<dyn ChatStore>,
    cache: DashMap<String, Session>,
    timeout: chrono::Duration,
    client_tag: String,
    default_language: String,
}

impl SessionStore {
    pub fn new(
        store: Arc<dyn ChatStore>,
        timeout: Duration,
        client_tag: impl Into<String>,
        default_language: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            timeout: chrono::Duration::from_std(timeout)
                .unwrap_or_else(|_| chrono::Duration::minutes(15)),
            client_tag: client_tag.into(),
            default_language: default_language.into(),
        }
    }

    pub async fn resolve_session(&self, client_token: Option<&str>) -> SessionResolution {
        self.resolve_session_at(client_token, Utc::now()).await
    }

    /// Resolve `client_token` as of `now`. Never fails; storage problems
    /// degrade to an in-memory session.
    pub async fn resolve_session_at(
        &self,
        client_token: Option<&str>,
        now: DateTime<Utc>,
    ) -> SessionResolution {
        let token = match client_token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(token) => token.to_string(),
            None => synthesize_token(now),
        };

        // Clone out of the map; no guard may live across an await.
        let cached = self.cache.get(&token).map(|entry| entry.value().clone());

        let resolution = match cached {
            Some(session) => self.continue_or_roll_over(session, now).await,
            None => match self.store.find_session(&token).await {
                Ok(Some(record)) => {
                    self.continue_or_roll_over(Session::from(record), now)
                        .await
                }
                Ok(None) => self.create(token, now).await,
                Err(e) => self.degraded(token, now, "find_session", &e),
            },
        };

        metrics::counter!(
            "session_resolutions_total",
            "outcome" => resolution.outcome.as_str()
        )
        .increment(1);

        tracing::debug!(
            session_id = %resolution.session.session_id,
            conversation_id = %resolution.session.conversation_id,
            outcome = resolution.outcome.as_str(),
            "Session resolved"
        );

        resolution
    }

    pub fn cached_session(&self, session_id: &str) -> Option<Session> {
        self.cache.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Drop cached sessions idle for longer than `max_idle`. They are
    /// reloaded from the store on next use. Degraded sessions exist only
    /// here, so they stay until they roll over. Returns the number evicted.
    pub fn evict_idle(&self, now: DateTime<Utc>, max_idle: Duration) -> usize {
        let max_idle = chrono::Duration::from_std(max_idle).unwrap_or(self.timeout);
        let before = self.cache.len();
        self.cache
            .retain(|_, session| session.storage_degraded || session.idle_for(now) <= max_idle);
        before.saturating_sub(self.cache.len())
    }

    async fn continue_or_roll_over(&self, session: Session, now: DateTime<Utc>) -> SessionResolution {
        if session.idle_for(now) > self.timeout {
            self.roll_over(session, now).await
        } else {
            self.resume(session, now).await
        }
    }

    async fn resume(&self, mut session: Session, now: DateTime<Utc>) -> SessionResolution {
        // Concurrent requests may both bump; last writer wins.
        if now > session.last_activity {
            session.last_activity = now;
        }
        self.cache.insert(session.session_id.clone(), session.clone());

        if !session.storage_degraded {
            if let Err(e) = self
                .store
                .touch_session(&session.session_id, session.last_activity)
                .await
            {
                tracing::warn!(
                    session_id = %session.session_id,
                    error = %e,
                    "Failed to persist session activity, continuing with cached session"
                );
                metrics::counter!("storage_degraded_total", "operation" => "touch_session")
                    .increment(1);
            }
        }

        SessionResolution {
            session,
            outcome: SessionOutcome::Resumed,
        }
    }

    async fn roll_over(&self, stale: Session, now: DateTime<Utc>) -> SessionResolution {
        let mut session = Session::new(
            stale.session_id.clone(),
            new_conversation_id(&stale.session_id, now),
            now,
        );
        session.previous_conversation_id = Some(stale.conversation_id.clone());

        tracing::info!(
            session_id = %session.session_id,
            conversation_id = %session.conversation_id,
            previous_conversation_id = %stale.conversation_id,
            idle_secs = stale.idle_for(now).num_seconds(),
            "Session idle past timeout, starting new conversation"
        );

        if let Err(e) = self.persist_new_conversation(&session).await {
            session.storage_degraded = true;
            tracing::warn!(
                session_id = %session.session_id,
                error = %e,
                "Failed to persist rollover, session kept in memory"
            );
            metrics::counter!("storage_degraded_total", "operation" => "roll_over").increment(1);
        } else if let Err(e) = self
            .store
            .end_conversation(&stale.conversation_id, now)
            .await
        {
            tracing::warn!(
                conversation_id = %stale.conversation_id,
                error = %e,
                "Failed to mark superseded conversation as ended"
            );
        }

        self.cache.insert(session.session_id.clone(), session.clone());

        SessionResolution {
            session,
            outcome: SessionOutcome::RolledOver,
        }
    }

    async fn create(&self, token: String, now: DateTime<Utc>) -> SessionResolution {
        let conversation_id = new_conversation_id(&token, now);
        let mut session = Session::new(token, conversation_id, now);

        if let Err(e) = self.persist_new_conversation(&session).await {
            session.storage_degraded = true;
            tracing::warn!(
                session_id = %session.session_id,
                error = %e,
                "Failed to persist new session, session kept in memory"
            );
            metrics::counter!("storage_degraded_total", "operation" => "create_session")
                .increment(1);
        } else {
            tracing::info!(
                session_id = %session.session_id,
                conversation_id = %session.conversation_id,
                "Created new session"
            );
        }

        self.cache.insert(session.session_id.clone(), session.clone());

        SessionResolution {
            session,
            outcome: SessionOutcome::Created,
        }
    }

    fn degraded(
        &self,
        token: String,
        now: DateTime<Utc>,
        operation: &'static str,
        error: &ChatError,
    ) -> SessionResolution {
        tracing::warn!(
            session_id = %token,
            error = %error,
            "Session store unavailable, serving in-memory session"
        );
        metrics::counter!("storage_degraded_total", "operation" => operation).increment(1);

        let conversation_id = new_conversation_id(&token, now);
        let mut session = Session::new(token, conversation_id, now);
        session.storage_degraded = true;
        self.cache.insert(session.session_id.clone(), session.clone());

        SessionResolution {
            session,
            outcome: SessionOutcome::Created,
        }
    }

    async fn persist_new_conversation(&self, session: &Session) -> Result<(), ChatError> {
        self.store
            .upsert_session(&SessionRecord::from(session))
            .await?;

        let mut conversation = Conversation::new(
            session.conversation_id.clone(),
            session.session_id.clone(),
            self.client_tag.clone(),
            self.default_language.clone(),
            session.started_at,
        );
        conversation.previous_conversation_id = session.previous_conversation_id.clone();
        self.store.create_conversation(&conversation).await
    }
}

/// Token for a client that did not supply one: creation time plus a random
/// alphanumeric suffix.
pub fn synthesize_token(now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_SUFFIX_LEN)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    format!("session_{}_{}", now.timestamp_millis(), suffix)
}

pub fn new_conversation_id(session_id: &str, now: DateTime<Utc>) -> String {
    format!("{}_{}", session_id, now.timestamp_millis())
}
