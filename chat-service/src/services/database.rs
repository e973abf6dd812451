//! MongoDB implementation of [`ChatStore`].
//!
//! Collections: `sessions` (keyed by client token, TTL on `last_activity`),
//! `conversations` (messages grown with `$push`), `message_id_mappings`
//! (unique on both sides) and `feedback`.

use crate::error::ChatError;
use crate::models::{Conversation, Feedback, IdMapping, Message, SessionRecord};
use crate::services::store::ChatStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, DateTime as BsonDateTime, Document},
    options::{IndexOptions, UpdateOptions},
    Client as MongoClient, Collection, Database, IndexModel,
};
use service_core::error::AppError;
use std::time::Duration;

#[derive(Clone)]
pub struct ChatDb {
    client: MongoClient,
    db: Database,
}

fn unavailable(operation: &str, e: impl std::fmt::Display) -> ChatError {
    tracing::error!(operation = %operation, "MongoDB operation failed: {}", e);
    metrics::counter!("db_errors_total", "operation" => operation.to_string()).increment(1);
    ChatError::StorageUnavailable(format!("{}: {}", operation, e))
}

fn to_bson_date(ts: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_millis(ts.timestamp_millis())
}

impl ChatDb {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, AppError> {
        tracing::info!("Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!("Failed to connect to MongoDB: {}", e);
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;
        let db = client.database(database);
        tracing::info!(database = %database, "Successfully connected to MongoDB database");
        Ok(Self { client, db })
    }

    pub async fn initialize_indexes(&self, session_ttl: Duration) -> Result<(), AppError> {
        tracing::info!("Creating MongoDB indexes for chat-service");

        self.create_index(
            "sessions",
            doc! { "session_id": 1 },
            IndexOptions::builder()
                .name("session_id_idx".to_string())
                .unique(true)
                .build(),
        )
        .await?;

        self.create_index(
            "sessions",
            doc! { "last_activity": 1 },
            IndexOptions::builder()
                .name("last_activity_ttl_idx".to_string())
                .expire_after(session_ttl)
                .build(),
        )
        .await?;

        self.create_index(
            "conversations",
            doc! { "conversation_id": 1 },
            IndexOptions::builder()
                .name("conversation_id_idx".to_string())
                .unique(true)
                .build(),
        )
        .await?;

        self.create_index(
            "conversations",
            doc! { "session_id": 1, "started_at": -1 },
            IndexOptions::builder()
                .name("session_started_idx".to_string())
                .build(),
        )
        .await?;

        self.create_index(
            "message_id_mappings",
            doc! { "local_id": 1 },
            IndexOptions::builder()
                .name("local_id_idx".to_string())
                .unique(true)
                .build(),
        )
        .await?;

        self.create_index(
            "message_id_mappings",
            doc! { "remote_id": 1 },
            IndexOptions::builder()
                .name("remote_id_idx".to_string())
                .unique(true)
                .build(),
        )
        .await?;

        self.create_index(
            "feedback",
            doc! { "message_id": 1 },
            IndexOptions::builder()
                .name("feedback_message_id_idx".to_string())
                .build(),
        )
        .await?;

        tracing::info!("Successfully created all MongoDB indexes");
        Ok(())
    }

    async fn create_index(
        &self,
        collection: &str,
        keys: Document,
        options: IndexOptions,
    ) -> Result<(), AppError> {
        let name = options.name.clone().unwrap_or_default();
        let index = IndexModel::builder().keys(keys).options(options).build();

        self.db
            .collection::<Document>(collection)
            .create_index(index, None)
            .await
            .map_err(|e| {
                tracing::error!(collection = %collection, index = %name, "Failed to create index: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;

        Ok(())
    }

    // Collection accessors

    pub fn sessions(&self) -> Collection<SessionRecord> {
        self.db.collection("sessions")
    }

    pub fn conversations(&self) -> Collection<Conversation> {
        self.db.collection("conversations")
    }

    pub fn mappings(&self) -> Collection<IdMapping> {
        self.db.collection("message_id_mappings")
    }

    pub fn feedback(&self) -> Collection<Feedback> {
        self.db.collection("feedback")
    }
}

#[async_trait]
impl ChatStore for ChatDb {
    async fn health_check(&self) -> Result<(), ChatError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| unavailable("ping", e))?;
        Ok(())
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<SessionRecord>, ChatError> {
        self.sessions()
            .find_one(doc! { "session_id": session_id }, None)
            .await
            .map_err(|e| unavailable("find_session", e))
    }

    async fn upsert_session(&self, record: &SessionRecord) -> Result<(), ChatError> {
        let mut update = doc! {
            "conversation_id": &record.conversation_id,
            "started_at": to_bson_date(record.started_at),
            "last_activity": to_bson_date(record.last_activity),
        };
        if let Some(previous) = &record.previous_conversation_id {
            update.insert("previous_conversation_id", previous);
        }

        self.sessions()
            .update_one(
                doc! { "session_id": &record.session_id },
                doc! { "$set": update },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await
            .map_err(|e| unavailable("upsert_session", e))?;

        Ok(())
    }

    async fn touch_session(
        &self,
        session_id: &str,
        last_activity: DateTime<Utc>,
    ) -> Result<(), ChatError> {
        self.sessions()
            .update_one(
                doc! { "session_id": session_id },
                doc! { "$set": { "last_activity": to_bson_date(last_activity) } },
                None,
            )
            .await
            .map_err(|e| unavailable("touch_session", e))?;

        Ok(())
    }

    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), ChatError> {
        let header = mongodb::bson::to_document(&conversation.header()).map_err(|e| {
            ChatError::StorageUnavailable(format!("Failed to serialize conversation: {}", e))
        })?;

        self.conversations()
            .update_one(
                doc! { "conversation_id": &conversation.id },
                doc! { "$setOnInsert": header },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await
            .map_err(|e| unavailable("create_conversation", e))?;

        Ok(())
    }

    async fn find_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, ChatError> {
        self.conversations()
            .find_one(doc! { "conversation_id": conversation_id }, None)
            .await
            .map_err(|e| unavailable("find_conversation", e))
    }

    async fn end_conversation(
        &self,
        conversation_id: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<(), ChatError> {
        self.conversations()
            .update_one(
                doc! { "conversation_id": conversation_id, "status": "active" },
                doc! {
                    "$set": {
                        "status": "ended",
                        "ended_at": ended_at.timestamp_millis(),
                    }
                },
                None,
            )
            .await
            .map_err(|e| unavailable("end_conversation", e))?;

        Ok(())
    }

    async fn append_messages(
        &self,
        conversation_id: &str,
        messages: &[Message],
    ) -> Result<(), ChatError> {
        let docs = messages
            .iter()
            .map(mongodb::bson::to_document)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                ChatError::StorageUnavailable(format!("Failed to serialize messages: {}", e))
            })?;

        self.conversations()
            .update_one(
                doc! { "conversation_id": conversation_id },
                doc! { "$push": { "messages": { "$each": docs } } },
                None,
            )
            .await
            .map_err(|e| unavailable("append_messages", e))?;

        Ok(())
    }

    async fn set_message_remote_id(
        &self,
        conversation_id: &str,
        message_id: &str,
        remote_id: &str,
    ) -> Result<(), ChatError> {
        self.conversations()
            .update_one(
                doc! { "conversation_id": conversation_id, "messages.id": message_id },
                doc! { "$set": { "messages.$.remote_id": remote_id } },
                None,
            )
            .await
            .map_err(|e| unavailable("set_message_remote_id", e))?;

        Ok(())
    }

    async fn upsert_mapping(&self, mapping: &IdMapping) -> Result<(), ChatError> {
        let mut set = doc! {
            "local_id": &mapping.local_id,
            "remote_id": &mapping.remote_id,
        };
        if let Some(snapshot) = &mapping.content_snapshot {
            set.insert("content_snapshot", snapshot);
        }

        self.mappings()
            .update_one(
                doc! {
                    "$or": [
                        { "local_id": &mapping.local_id },
                        { "remote_id": &mapping.remote_id },
                    ]
                },
                doc! {
                    "$set": set,
                    "$setOnInsert": { "created_at": mapping.created_at.timestamp_millis() },
                },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await
            .map_err(|e| unavailable("upsert_mapping", e))?;

        Ok(())
    }

    async fn find_mapping(&self, id: &str) -> Result<Option<IdMapping>, ChatError> {
        self.mappings()
            .find_one(
                doc! { "$or": [ { "local_id": id }, { "remote_id": id } ] },
                None,
            )
            .await
            .map_err(|e| unavailable("find_mapping", e))
    }

    async fn insert_feedback(&self, feedback: &Feedback) -> Result<(), ChatError> {
        self.feedback()
            .insert_one(feedback, None)
            .await
            .map_err(|e| unavailable("insert_feedback", e))?;
        Ok(())
    }

    async fn find_feedback(&self, message_id: &str) -> Result<Vec<Feedback>, ChatError> {
        let cursor = self
            .feedback()
            .find(
                doc! {
                    "$or": [
                        { "message_id": message_id },
                        { "local_id": message_id },
                        { "remote_id": message_id },
                    ]
                },
                None,
            )
            .await
            .map_err(|e| unavailable("find_feedback", e))?;

        cursor
            .try_collect()
            .await
            .map_err(|e| unavailable("find_feedback", e))
    }
}
