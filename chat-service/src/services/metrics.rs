//! Prometheus exposition for chat-service.
//!
//! Metrics are recorded through the `metrics` facade wherever they occur and
//! rendered here for `GET /metrics`.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Install the global recorder. Safe to call more than once; later calls
/// return the existing handle.
pub fn init_metrics() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| {
            let builder = match PrometheusBuilder::new().set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                DURATION_BUCKETS,
            ) {
                Ok(builder) => builder,
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid histogram buckets, using summaries");
                    PrometheusBuilder::new()
                }
            };

            let recorder = builder.build_recorder();
            let handle = recorder.handle();
            if metrics::set_global_recorder(recorder).is_err() {
                tracing::warn!("A metrics recorder was already installed");
            } else {
                tracing::info!("Prometheus metrics initialized");
            }
            handle
        })
        .clone()
}

/// Current metrics in Prometheus text format.
pub fn get_metrics() -> String {
    match HANDLE.get() {
        Some(handle) => handle.render(),
        None => {
            tracing::error!("Metrics recorder not initialized");
            "# Metrics recorder not initialized\n".to_string()
        }
    }
}
