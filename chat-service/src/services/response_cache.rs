//! Short-lived memoization of final chat replies.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Reply payload as returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedReply {
    pub reply: String,
    pub session_id: String,
    pub conversation_id: String,
    pub message_id: String,
    /// Filled in once the analytics forwarder acknowledges the turn.
    pub remote_message_id: Option<String>,
    pub language: String,
}

/// Digest of the request shape that determines a reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Attachments are keyed by identity, not order.
    pub fn new(session_id: &str, text: &str, language: &str, attachments: &[String]) -> Self {
        let mut attachments: Vec<&str> = attachments.iter().map(|a| a.trim()).collect();
        attachments.sort_unstable();

        let text = normalize_text(text);
        let language = language.trim().to_lowercase();
        let count = attachments.len().to_string();

        let mut hasher = Sha256::new();
        for part in [session_id.trim(), text.as_str(), language.as_str(), count.as_str()]
            .into_iter()
            .chain(attachments)
        {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

struct Entry {
    payload: CachedReply,
    stored_at: DateTime<Utc>,
}

pub struct ResponseCache {
    entries: DashMap<CacheKey, Entry>,
    ttl: chrono::Duration,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1)),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedReply> {
        self.get_at(key, Utc::now())
    }

    /// Stale entries are reported as a miss and removed.
    pub fn get_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CachedReply> {
        let (payload, stale) = {
            let entry = self.entries.get(key)?;
            (entry.payload.clone(), now - entry.stored_at > self.ttl)
        };

        if stale {
            self.entries
                .remove_if(key, |_, entry| now - entry.stored_at > self.ttl);
            return None;
        }

        Some(payload)
    }

    pub fn put(&self, key: CacheKey, payload: CachedReply) {
        self.put_at(key, payload, Utc::now());
    }

    pub fn put_at(&self, key: CacheKey, payload: CachedReply, now: DateTime<Utc>) {
        self.entries.insert(
            key,
            Entry {
                payload,
                stored_at: now,
            },
        );
    }

    /// Attach the remote id to the entry written for `message_id`. Returns
    /// `false` when that entry is gone or was replaced by a later turn.
    pub fn backfill_remote_id(&self, key: &CacheKey, message_id: &str, remote_id: &str) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.payload.message_id == message_id => {
                entry.payload.remote_message_id = Some(remote_id.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| now - entry.stored_at <= ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "Swept expired response cache entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(text: &str) -> CachedReply {
        CachedReply {
            reply: text.to_string(),
            session_id: "s1".to_string(),
            conversation_id: "c1".to_string(),
            message_id: "msg-1".to_string(),
            remote_message_id: None,
            language: "en".to_string(),
        }
    }

    fn urls(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_key_distinguishes_attachments() {
        let cat = CacheKey::new("s1", "describe this", "en", &urls(&["https://cdn/cat.png"]));
        let invoice = CacheKey::new("s1", "describe this", "en", &urls(&["https://cdn/invoice.pdf"]));
        assert_ne!(cat, invoice);
        assert_eq!(
            CacheKey::new("s1", "x", "en", &urls(&["b", "a"])),
            CacheKey::new("s1", "x", "en", &urls(&["a", "b"]))
        );
        assert_ne!(
            CacheKey::new("s1", "x", "en", &urls(&["ab"])),
            CacheKey::new("s1", "x", "en", &urls(&["a", "b"]))
        );
    }

    #[test]
    fn test_put_then_get_returns_payload() {
        let cache = ResponseCache::new(Duration::from_secs(3600));
        let key = CacheKey::new("s1", "Hello", "en", &[]);
        cache.put(key.clone(), reply("hi there"));
        assert_eq!(cache.get(&key), Some(reply("hi there")));
    }

    #[test]
    fn test_expired_entry_misses_without_sweep() {
        let cache = ResponseCache::new(Duration::from_secs(3600));
        let key = CacheKey::new("s1", "Hello", "en", &[]);
        let t0 = Utc::now();
        cache.put_at(key.clone(), reply("hi"), t0);

        assert!(cache.get_at(&key, t0 + chrono::Duration::minutes(59)).is_some());
        assert!(cache.get_at(&key, t0 + chrono::Duration::minutes(61)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_key_normalizes_text() {
        assert_eq!(
            CacheKey::new("s1", "  Hello   World ", "EN", &[]),
            CacheKey::new("s1", "hello world", "en", &[])
        );
    }

    #[test]
    fn test_key_separates_request_shapes() {
        let base = CacheKey::new("s1", "hello", "en", &[]);
        assert_ne!(base, CacheKey::new("s2", "hello", "en", &[]));
        assert_ne!(base, CacheKey::new("s1", "hello", "fr", &[]));
        assert_ne!(base, CacheKey::new("s1", "hello", "en", &urls(&["a.png"])));
        assert_ne!(CacheKey::new("s1", "ab", "c", &[]), CacheKey::new("s1a", "b", "c", &[]));
    }

    #[test]
    fn test_backfill_after_eviction_is_noop() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let key = CacheKey::new("s1", "hello", "en", &[]);
        let t0 = Utc::now() - chrono::Duration::minutes(5);
        cache.put_at(key.clone(), reply("hi"), t0);

        assert_eq!(cache.sweep(), 1);
        assert!(!cache.backfill_remote_id(&key, "msg-1", "pg-1"));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_backfill_sets_remote_id() {
        let cache = ResponseCache::new(Duration::from_secs(3600));
        let key = CacheKey::new("s1", "hello", "en", &[]);
        cache.put(key.clone(), reply("hi"));

        assert!(cache.backfill_remote_id(&key, "msg-1", "pg-9"));
        assert_eq!(
            cache.get(&key).unwrap().remote_message_id.as_deref(),
            Some("pg-9")
        );
    }

    #[test]
    fn test_backfill_skips_entry_replaced_by_later_turn() {
        let cache = ResponseCache::new(Duration::from_secs(3600));
        let key = CacheKey::new("s1", "hello", "en", &[]);
        cache.put(key.clone(), reply("first"));
        let mut later = reply("second");
        later.message_id = "msg-2".to_string();
        cache.put(key.clone(), later);

        assert!(!cache.backfill_remote_id(&key, "msg-1", "pg-of-first"));
        let entry = cache.get(&key).unwrap();
        assert_eq!(entry.message_id, "msg-2");
        assert_eq!(entry.remote_message_id, None);
    }
}
