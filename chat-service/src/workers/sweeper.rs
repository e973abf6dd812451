//! Periodic eviction of process-local correlation state.

use crate::services::dedup::{ForwardLedger, MessageDeduplicator};
use crate::services::response_cache::ResponseCache;
use crate::services::session_store::SessionStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub cache_entries: usize,
    pub dedup_signatures: usize,
    pub forward_signatures: usize,
    pub sessions: usize,
}

pub struct Sweeper {
    cache: Arc<ResponseCache>,
    dedup: Arc<MessageDeduplicator>,
    ledger: Arc<ForwardLedger>,
    sessions: Arc<SessionStore>,
    interval: Duration,
    session_idle: Duration,
}

impl Sweeper {
    pub fn new(
        cache: Arc<ResponseCache>,
        dedup: Arc<MessageDeduplicator>,
        ledger: Arc<ForwardLedger>,
        sessions: Arc<SessionStore>,
        interval: Duration,
        session_idle: Duration,
    ) -> Self {
        Self {
            cache,
            dedup,
            ledger,
            sessions,
            interval: interval.max(Duration::from_secs(1)),
            session_idle,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        // First tick completes immediately.
        ticker.tick().await;

        tracing::info!(interval_secs = self.interval.as_secs(), "Sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep_once(Utc::now());
                }
            }
        }
    }

    pub fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let report = SweepReport {
            cache_entries: self.cache.sweep_at(now),
            dedup_signatures: self.dedup.sweep(now),
            forward_signatures: self.ledger.sweep(now),
            sessions: self.sessions.evict_idle(now, self.session_idle),
        };

        tracing::info!(
            cache_entries = report.cache_entries,
            dedup_signatures = report.dedup_signatures,
            forward_signatures = report.forward_signatures,
            sessions = report.sessions,
            "Swept expired correlation state"
        );

        report
    }
}
