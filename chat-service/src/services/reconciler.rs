//! Bidirectional local/remote message id reconciliation.
//!
//! Mappings are written through to the durable store and mirrored in a
//! process-local index so feedback can still be attributed while the store is
//! unreachable.

use crate::models::IdMapping;
use crate::services::store::ChatStore;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;

const DEFAULT_MAX_CACHED: usize = 10_000;

/// Both identifiers of a message a feedback submission refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedbackTarget {
    pub local_id: String,
    pub remote_id: String,
}

struct CachedMapping {
    mapping: IdMapping,
    /// Durable copy confirmed. Unpersisted entries are never evicted.
    persisted: bool,
}

pub struct IdReconciler {
    store: Arc<dyn ChatStore>,
    by_local: DashMap<String, CachedMapping>,
    by_remote: DashMap<String, String>,
    max_cached: usize,
}

impl IdReconciler {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self::with_capacity(store, DEFAULT_MAX_CACHED)
    }

    pub fn with_capacity(store: Arc<dyn ChatStore>, max_cached: usize) -> Self {
        Self {
            store,
            by_local: DashMap::new(),
            by_remote: DashMap::new(),
            max_cached,
        }
    }

    /// Upsert the pair. An existing mapping for either side is updated in
    /// place. Store failures are logged and the mapping kept locally.
    pub async fn record_mapping(
        &self,
        local_id: &str,
        remote_id: &str,
        content_snapshot: Option<String>,
    ) {
        let mapping = IdMapping::new(local_id, remote_id, content_snapshot);

        let persisted = match self.store.upsert_mapping(&mapping).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    local_id = %local_id,
                    remote_id = %remote_id,
                    error = %e,
                    "Failed to persist id mapping, keeping it in memory"
                );
                metrics::counter!("storage_degraded_total", "operation" => "upsert_mapping")
                    .increment(1);
                false
            }
        };

        self.cache(mapping, persisted);

        tracing::debug!(local_id = %local_id, remote_id = %remote_id, "Recorded id mapping");
    }

    pub async fn resolve_remote_id(&self, local_id: &str) -> Option<String> {
        if let Some(entry) = self.by_local.get(local_id) {
            return Some(entry.mapping.remote_id.clone());
        }

        match self.store.find_mapping(local_id).await {
            Ok(Some(mapping)) if mapping.local_id == local_id => {
                let remote_id = mapping.remote_id.clone();
                self.cache(mapping, true);
                Some(remote_id)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(local_id = %local_id, error = %e, "Mapping lookup failed");
                None
            }
        }
    }

    /// Resolve a feedback id given in either identifier space.
    pub async fn resolve_feedback_target(&self, id: &str) -> Option<FeedbackTarget> {
        if let Some(target) = self.cached_target(id) {
            return Some(target);
        }

        match self.store.find_mapping(id).await {
            Ok(Some(mapping)) => {
                let target = FeedbackTarget {
                    local_id: mapping.local_id.clone(),
                    remote_id: mapping.remote_id.clone(),
                };
                self.cache(mapping, true);
                Some(target)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(message_id = %id, error = %e, "Feedback target lookup failed");
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_local.is_empty()
    }

    fn cached_target(&self, id: &str) -> Option<FeedbackTarget> {
        if let Some(entry) = self.by_local.get(id) {
            return Some(FeedbackTarget {
                local_id: entry.mapping.local_id.clone(),
                remote_id: entry.mapping.remote_id.clone(),
            });
        }

        let local_id = self.by_remote.get(id).map(|entry| entry.value().clone())?;
        self.by_local.get(&local_id).map(|entry| FeedbackTarget {
            local_id: entry.mapping.local_id.clone(),
            remote_id: entry.mapping.remote_id.clone(),
        })
    }

    fn cache(&self, mapping: IdMapping, persisted: bool) {
        // A remap replaces the old remote id for this local id.
        if let Some(previous) = self.by_local.get(&mapping.local_id) {
            let old_remote = previous.mapping.remote_id.clone();
            drop(previous);
            if old_remote != mapping.remote_id {
                self.by_remote.remove(&old_remote);
            }
        }
        // And the remote id can only point at one local id.
        if let Some(old_local) = self
            .by_remote
            .get(&mapping.remote_id)
            .map(|entry| entry.value().clone())
        {
            if old_local != mapping.local_id {
                self.by_local.remove(&old_local);
            }
        }

        self.by_remote
            .insert(mapping.remote_id.clone(), mapping.local_id.clone());
        self.by_local.insert(
            mapping.local_id.clone(),
            CachedMapping { mapping, persisted },
        );

        if self.by_local.len() > self.max_cached {
            self.evict_persisted();
        }
    }

    fn evict_persisted(&self) {
        let target = self.max_cached / 2;
        let evictable: Vec<(String, String)> = self
            .by_local
            .iter()
            .filter(|entry| entry.persisted)
            .map(|entry| (entry.key().clone(), entry.mapping.remote_id.clone()))
            .take(self.by_local.len().saturating_sub(target))
            .collect();

        for (local_id, remote_id) in evictable {
            self.by_local.remove(&local_id);
            self.by_remote.remove(&remote_id);
        }
    }
}
