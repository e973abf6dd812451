#![allow(dead_code)]

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chat_service::config::{
    AnalyticsConfig, ChatConfig, CorrelationConfig, ProviderConfig, ProviderKind, StorageBackend,
    StorageConfig,
};
use chat_service::services::providers::MockChatProvider;
use chat_service::services::InMemoryChatStore;
use chat_service::startup::Application;
use serde_json::{json, Value};
use service_core::config::{Config as CoreConfig, LogFormat};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// How the stub answers `POST /conversations`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StubReply {
    Ids,
    Status(u16),
    Malformed,
}

/// Records what the chat service forwards and hands back `pg-{n}-{i}` ids.
#[derive(Default)]
pub struct StubAnalytics {
    pub conversations: Mutex<Vec<Value>>,
    pub feedback: Mutex<Vec<Value>>,
    attempts: AtomicUsize,
    seq: AtomicUsize,
    /// 0 answers with ids, 1 with a non-JSON body, anything else is a status.
    reply: AtomicU16,
}

impl StubAnalytics {
    pub fn reply_with(&self, reply: StubReply) {
        let code = match reply {
            StubReply::Ids => 0,
            StubReply::Malformed => 1,
            StubReply::Status(status) => status,
        };
        self.reply.store(code, Ordering::SeqCst);
    }

    /// Every `POST /conversations`, accepted or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.lock().unwrap().len()
    }

    pub fn feedback_count(&self) -> usize {
        self.feedback.lock().unwrap().len()
    }
}

async fn stub_conversations(
    State(stub): State<Arc<StubAnalytics>>,
    Json(body): Json<Value>,
) -> Response {
    stub.attempts.fetch_add(1, Ordering::SeqCst);
    match stub.reply.load(Ordering::SeqCst) {
        0 => {}
        1 => return "<html>gateway</html>".into_response(),
        status => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return (status, Json(json!({ "error": "rejected" }))).into_response();
        }
    }

    let n = stub.seq.fetch_add(1, Ordering::SeqCst) + 1;
    let count = body["messages"].as_array().map(|m| m.len()).unwrap_or(0);
    let ids: Vec<String> = (0..count).map(|i| format!("pg-{}-{}", n, i)).collect();
    stub.conversations.lock().unwrap().push(body);
    Json(json!({ "message_ids": ids })).into_response()
}

async fn stub_feedback(
    State(stub): State<Arc<StubAnalytics>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    stub.feedback.lock().unwrap().push(body);
    Json(json!({ "ok": true }))
}

async fn spawn_stub_analytics() -> (String, Arc<StubAnalytics>) {
    let stub = Arc::new(StubAnalytics::default());
    let router = Router::new()
        .route("/conversations", post(stub_conversations))
        .route("/feedback", post(stub_feedback))
        .with_state(stub.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind stub analytics");
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    (format!("http://127.0.0.1:{}", port), stub)
}

pub fn test_config(analytics_url: Option<String>) -> ChatConfig {
    ChatConfig {
        common: CoreConfig {
            port: 0,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        },
        storage: StorageConfig {
            backend: StorageBackend::Memory,
            mongodb: None,
            session_record_ttl_days: 30,
        },
        provider: ProviderConfig {
            kind: ProviderKind::Mock,
            api_key: String::new(),
            model: "mock".to_string(),
        },
        analytics: AnalyticsConfig {
            enabled: analytics_url.is_some(),
            base_url: analytics_url.unwrap_or_default(),
            api_key: Some("test-key".to_string()),
            timeout_secs: 5,
            retry_max_secs: 2,
        },
        correlation: CorrelationConfig {
            client_tag: "web".to_string(),
            default_language: "en".to_string(),
            session_timeout_secs: 900,
            response_cache_ttl_secs: 3600,
            dedup_max_entries: 1000,
            dedup_prefix_chars: 40,
            background_queue_size: 64,
        },
        otlp_endpoint: None,
    }
}

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub store: Arc<InMemoryChatStore>,
    pub provider: Arc<MockChatProvider>,
    pub analytics: Arc<StubAnalytics>,
    pub client: reqwest::Client,
}

impl TestApp {
    /// Chat service with an in-memory store, the mock model and a stub
    /// analytics service.
    pub async fn spawn() -> Self {
        let (analytics_url, analytics) = spawn_stub_analytics().await;
        let config = test_config(Some(analytics_url));

        let store = Arc::new(InMemoryChatStore::new());
        let provider = Arc::new(MockChatProvider::new());

        let app = Application::build_with(config, store.clone(), provider.clone())
            .await
            .expect("Failed to build test application");
        let port = app.http_port();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::new();
        let health_url = format!("http://127.0.0.1:{}/health", port);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        TestApp {
            address: format!("http://127.0.0.1:{}", port),
            port,
            store,
            provider,
            analytics,
            client,
        }
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.address, path))
            .json(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn chat(&self, session_id: &str, message: &str) -> Value {
        let response = self
            .post_json("/chat", &json!({ "sessionId": session_id, "message": message }))
            .await;
        assert_eq!(response.status().as_u16(), 200);
        response.json().await.expect("Failed to parse JSON")
    }

    /// Poll `check` for up to five seconds.
    pub async fn wait_until(&self, check: impl Fn(&TestApp) -> bool) -> bool {
        for _ in 0..100 {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    /// Resubmit a turn until the cached reply carries its analytics id.
    pub async fn wait_for_remote_id(&self, session_id: &str, message: &str) -> String {
        for _ in 0..100 {
            let body = self.chat(session_id, message).await;
            if let Some(remote) = body["remote_message_id"].as_str() {
                return remote.to_string();
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("remote id was never back-filled");
    }
}
