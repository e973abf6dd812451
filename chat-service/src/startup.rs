//! Application startup and lifecycle management.

use crate::config::{ChatConfig, ProviderKind, StorageBackend};
use crate::services::providers::{ChatProvider, GeminiChatProvider, GeminiConfig, MockChatProvider};
use crate::services::{
    ChatDb, ChatEvents, ChatService, ChatStore, ForwardLedger, HttpAnalyticsForwarder,
    InMemoryChatStore, MessageDeduplicator,
};
use crate::workers::{BackgroundJob, JobQueue, Sweeper, TurnRecorder};
use crate::{build_router, AppState};
use service_core::error::AppError;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    recorder: TurnRecorder,
    jobs: mpsc::Receiver<BackgroundJob>,
    sweeper: Sweeper,
}

impl Application {
    /// Build the application with the store and provider named in `config`.
    pub async fn build(config: ChatConfig) -> Result<Self, AppError> {
        let store = connect_store(&config).await?;
        let provider = build_provider(&config)?;
        Self::build_with(config, store, provider).await
    }

    /// Build the application around an already constructed store and provider.
    pub async fn build_with(
        config: ChatConfig,
        store: Arc<dyn ChatStore>,
        provider: Arc<dyn ChatProvider>,
    ) -> Result<Self, AppError> {
        crate::services::metrics::init_metrics();

        let correlation = &config.correlation;
        let events = ChatEvents::new(EVENT_CHANNEL_CAPACITY);
        let (queue, jobs) = JobQueue::channel(correlation.background_queue_size);

        let chat = Arc::new(ChatService::new(
            correlation,
            store.clone(),
            provider,
            queue,
            events.clone(),
        ));

        // Signatures outlive the cache entries they guard by one sweep at most.
        let dedup = Arc::new(MessageDeduplicator::new(
            correlation.dedup_prefix_chars,
            correlation.dedup_max_entries,
            correlation.response_cache_ttl(),
        ));
        let ledger = Arc::new(ForwardLedger::new(correlation.response_cache_ttl()));

        let mut recorder = TurnRecorder::new(
            store.clone(),
            chat.reconciler(),
            chat.cache(),
            events.clone(),
            dedup.clone(),
            ledger.clone(),
        );

        if config.analytics.enabled {
            let forwarder = HttpAnalyticsForwarder::new(&config.analytics)?;
            recorder =
                recorder.with_forwarder(Arc::new(forwarder), config.analytics.retry_max_elapsed());
            tracing::info!(base_url = %config.analytics.base_url, "Analytics forwarding enabled");
        } else {
            tracing::info!("Analytics forwarding disabled");
        }

        let sweeper = Sweeper::new(
            chat.cache(),
            dedup,
            ledger,
            chat.sessions(),
            correlation.response_cache_ttl(),
            correlation.session_timeout(),
        );

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Chat service listening on port {}", port);

        let state = AppState {
            config,
            store,
            chat,
            events,
            shutdown: CancellationToken::new(),
        };

        Ok(Self {
            port,
            listener,
            state,
            recorder,
            jobs,
            sweeper,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `signal` resolves, then stop the background workers. Jobs
    /// already queued are recorded before this returns.
    pub async fn run_until<F>(self, signal: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Application {
            listener,
            state,
            recorder,
            jobs,
            sweeper,
            ..
        } = self;

        let workers = CancellationToken::new();
        let recorder_handle = tokio::spawn(recorder.run(jobs, workers.clone()));
        let sweeper_handle = tokio::spawn(sweeper.run(workers.clone()));

        // Event streams never end on their own; close them as soon as the
        // signal fires so in-flight requests can drain.
        let streams = state.shutdown.clone();
        let result = axum::serve(listener, build_router(state))
            .with_graceful_shutdown(async move {
                signal.await;
                streams.cancel();
            })
            .await;

        workers.cancel();
        if let Err(e) = recorder_handle.await {
            tracing::error!("Turn recorder task failed: {}", e);
        }
        if let Err(e) = sweeper_handle.await {
            tracing::error!("Sweeper task failed: {}", e);
        }

        result.map_err(|e| {
            tracing::error!("HTTP server error: {}", e);
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}

async fn connect_store(config: &ChatConfig) -> Result<Arc<dyn ChatStore>, AppError> {
    match config.storage.backend {
        StorageBackend::Mongodb => {
            let mongo = config.storage.mongodb.as_ref().ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!("mongodb backend needs MONGODB_URI"))
            })?;

            let db = ChatDb::connect(&mongo.uri, &mongo.database)
                .await
                .map_err(|e| {
                    tracing::error!("Failed to connect to MongoDB: {}", e);
                    e
                })?;

            db.initialize_indexes(config.storage.session_record_ttl())
                .await
                .map_err(|e| {
                    tracing::error!("Failed to initialize database indexes: {}", e);
                    e
                })?;

            Ok(Arc::new(db))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory store, state will not survive a restart");
            Ok(Arc::new(InMemoryChatStore::new()))
        }
    }
}

fn build_provider(config: &ChatConfig) -> Result<Arc<dyn ChatProvider>, AppError> {
    match config.provider.kind {
        ProviderKind::Gemini => {
            let provider = GeminiChatProvider::new(GeminiConfig {
                api_key: config.provider.api_key.clone(),
                model: config.provider.model.clone(),
            })
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("{}", e)))?;

            tracing::info!(model = %config.provider.model, "Initialized Gemini chat provider");
            Ok(Arc::new(provider))
        }
        ProviderKind::Mock => {
            tracing::warn!("Using mock chat provider");
            Ok(Arc::new(MockChatProvider::new()))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
