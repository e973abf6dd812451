use crate::config::LogFormat;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, runtime, trace as sdktrace};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// What [`init_tracing`] needs to know about the running service.
#[derive(Debug, Clone, Copy)]
pub struct TracingSettings<'a> {
    pub service_name: &'a str,
    pub service_version: &'a str,
    /// Filter directive used when `RUST_LOG` is unset.
    pub log_level: &'a str,
    pub log_format: LogFormat,
    /// Collector address. No export layer is installed when `None`.
    pub otlp_endpoint: Option<&'a str>,
}

/// Install the global subscriber.
///
/// A failing OTLP pipeline is reported on stderr and the service keeps
/// logging locally.
pub fn init_tracing(settings: &TracingSettings<'_>) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(settings.log_level));

    let telemetry = settings
        .otlp_endpoint
        .and_then(|endpoint| otlp_tracer(settings, endpoint))
        .map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    let (json, pretty) = match settings.log_format {
        LogFormat::Json => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_file(true)
                    .with_line_number(true)
                    .json()
                    .flatten_event(true),
            ),
            None,
        ),
        LogFormat::Pretty => (None, Some(tracing_subscriber::fmt::layer().pretty())),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(telemetry)
        .with(json)
        .with(pretty)
        .init();
}

fn otlp_tracer(settings: &TracingSettings<'_>, endpoint: &str) -> Option<sdktrace::Tracer> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    let resource = Resource::new(vec![
        KeyValue::new("service.name", settings.service_name.to_string()),
        KeyValue::new("service.version", settings.service_version.to_string()),
    ]);

    match opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(sdktrace::config().with_resource(resource))
        .install_batch(runtime::Tokio)
    {
        Ok(tracer) => Some(tracer),
        Err(e) => {
            eprintln!(
                "OTLP export for '{}' disabled, collector at '{}' unusable: {}",
                settings.service_name, endpoint, e
            );
            None
        }
    }
}
