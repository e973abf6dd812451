use chat_service::config::ChatConfig;
use chat_service::startup::Application;
use service_core::observability::{init_tracing, TracingSettings};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = ChatConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(&TracingSettings {
        service_name: "chat-service",
        service_version: env!("CARGO_PKG_VERSION"),
        log_level: &config.common.log_level,
        log_format: config.common.log_format,
        otlp_endpoint: config.otlp_endpoint.as_deref(),
    });

    let application = Application::build(config).await.map_err(|e| {
        tracing::error!("Failed to build application: {}", e);
        std::io::Error::other(format!("Startup error: {}", e))
    })?;

    application.run_until_stopped().await
}
