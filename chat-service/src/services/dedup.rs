//! Duplicate suppression for recorded turns.
//!
//! Two independent gates. [`MessageDeduplicator`] stops the same
//! (conversation, user text, bot text) pair from being persisted twice.
//! [`ForwardLedger`] sits at the analytics boundary and remembers which
//! assistant messages were already forwarded, so a retry reuses the remote id
//! obtained the first time.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

struct RecencySet {
    members: HashSet<String>,
    order: VecDeque<(String, DateTime<Utc>)>,
}

/// Bounded, process-local recency set of turn signatures.
///
/// Signatures are built from truncated prefixes, so two turns that differ only
/// past the prefix collide and the later one is treated as a duplicate.
pub struct MessageDeduplicator {
    prefix_chars: usize,
    max_entries: usize,
    max_age: chrono::Duration,
    inner: Mutex<RecencySet>,
}

impl MessageDeduplicator {
    pub fn new(prefix_chars: usize, max_entries: usize, max_age: Duration) -> Self {
        Self {
            prefix_chars,
            max_entries: max_entries.max(2),
            max_age: chrono::Duration::from_std(max_age)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
            inner: Mutex::new(RecencySet {
                members: HashSet::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn signature(&self, conversation_id: &str, user_text: &str, bot_text: &str) -> String {
        format!(
            "{}|{}|{}",
            conversation_id,
            prefix(user_text, self.prefix_chars),
            prefix(bot_text, self.prefix_chars)
        )
    }

    /// Returns `true` and records the signature when the pair is new;
    /// `false` when it was already seen.
    pub fn should_process(&self, conversation_id: &str, user_text: &str, bot_text: &str) -> bool {
        self.should_process_at(conversation_id, user_text, bot_text, Utc::now())
    }

    pub fn should_process_at(
        &self,
        conversation_id: &str,
        user_text: &str,
        bot_text: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let signature = self.signature(conversation_id, user_text, bot_text);

        let Ok(mut guard) = self.inner.lock() else {
            // A poisoned guard only loses dedup; let the turn through.
            tracing::error!("Deduplicator lock poisoned, accepting turn");
            return true;
        };
        let set = &mut *guard;

        if set.members.contains(&signature) {
            tracing::debug!(conversation_id = %conversation_id, "Duplicate message pair rejected");
            metrics::counter!("dedup_rejections_total", "gate" => "local").increment(1);
            return false;
        }

        set.members.insert(signature.clone());
        set.order.push_back((signature, now));

        if set.order.len() > self.max_entries {
            let drop = set.order.len() / 2;
            for (old, _) in set.order.drain(..drop) {
                set.members.remove(&old);
            }
            tracing::debug!(dropped = drop, "Pruned oldest half of dedup signatures");
        }

        true
    }

    /// Remove signatures older than the configured window.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let Ok(mut guard) = self.inner.lock() else {
            return 0;
        };
        let set = &mut *guard;

        let mut removed = 0;
        while let Some((_, seen_at)) = set.order.front() {
            if now - *seen_at <= self.max_age {
                break;
            }
            if let Some((old, _)) = set.order.pop_front() {
                set.members.remove(&old);
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|set| set.members.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Forwarding-boundary gate keyed by assistant content and timestamp.
pub struct ForwardLedger {
    entries: DashMap<String, (String, DateTime<Utc>)>,
    max_age: chrono::Duration,
}

impl ForwardLedger {
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_age: chrono::Duration::from_std(max_age)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
        }
    }

    pub fn signature(content: &str, timestamp: DateTime<Utc>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hasher.update(b"|");
        hasher.update(timestamp.timestamp_millis().to_be_bytes());
        hex::encode(hasher.finalize())
    }

    /// Remote id previously obtained for this signature, if any.
    pub fn has_been_forwarded(&self, signature: &str) -> Option<String> {
        let remote_id = self
            .entries
            .get(signature)
            .map(|entry| entry.value().0.clone());
        if remote_id.is_some() {
            metrics::counter!("dedup_rejections_total", "gate" => "forward").increment(1);
        }
        remote_id
    }

    pub fn record(&self, signature: impl Into<String>, remote_id: impl Into<String>) {
        self.entries
            .insert(signature.into(), (remote_id.into(), Utc::now()));
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let max_age = self.max_age;
        self.entries
            .retain(|_, (_, recorded_at)| now - *recorded_at <= max_age);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn prefix(text: &str, chars: usize) -> &str {
    match text.char_indices().nth(chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dedup() -> MessageDeduplicator {
        MessageDeduplicator::new(40, 1000, Duration::from_secs(3600))
    }

    #[test]
    fn test_second_identical_pair_rejected() {
        let dedup = dedup();
        assert!(dedup.should_process("c1", "hi", "hello"));
        assert!(!dedup.should_process("c1", "hi", "hello"));
        assert!(dedup.should_process("c2", "hi", "hello"));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_prefix_collision_is_duplicate() {
        let dedup = MessageDeduplicator::new(5, 1000, Duration::from_secs(3600));
        assert!(dedup.should_process("c1", "hello world", "fine thanks"));
        assert!(!dedup.should_process("c1", "hello there", "fine, you?"));
    }

    #[test]
    fn test_prefix_respects_char_boundaries() {
        assert_eq!(prefix("héllo", 2), "hé");
        assert_eq!(prefix("ab", 10), "ab");
        assert_eq!(prefix("日本語テキスト", 3), "日本語");
    }

    #[test]
    fn test_prunes_oldest_half_when_full() {
        let dedup = MessageDeduplicator::new(40, 4, Duration::from_secs(3600));
        for i in 0..5 {
            assert!(dedup.should_process("c1", &format!("q{}", i), "a"));
        }
        // 5 > 4 so the two oldest are dropped.
        assert_eq!(dedup.len(), 3);
        assert!(dedup.should_process("c1", "q0", "a"));
        assert!(!dedup.should_process("c1", "q4", "a"));
    }

    #[test]
    fn test_sweep_removes_aged_signatures() {
        let dedup = MessageDeduplicator::new(40, 100, Duration::from_secs(60));
        let t0 = Utc::now();
        dedup.should_process_at("c1", "old", "a", t0);
        dedup.should_process_at("c1", "new", "a", t0 + chrono::Duration::seconds(90));

        let removed = dedup.sweep(t0 + chrono::Duration::seconds(100));
        assert_eq!(removed, 1);
        assert!(dedup.should_process("c1", "old", "a"));
    }

    #[test]
    fn test_forward_ledger_short_circuits() {
        let ledger = ForwardLedger::new(Duration::from_secs(3600));
        let ts = Utc::now();
        let signature = ForwardLedger::signature("hello", ts);

        assert!(ledger.has_been_forwarded(&signature).is_none());
        ledger.record(signature.clone(), "pg-42");
        assert_eq!(ledger.has_been_forwarded(&signature).as_deref(), Some("pg-42"));

        let other = ForwardLedger::signature("hello", ts + chrono::Duration::milliseconds(1));
        assert!(ledger.has_been_forwarded(&other).is_none());
    }

    #[test]
    fn test_forward_ledger_sweep() {
        let ledger = ForwardLedger::new(Duration::from_secs(60));
        ledger.record("sig", "pg-1");
        assert_eq!(ledger.sweep(Utc::now() + chrono::Duration::seconds(120)), 1);
        assert!(ledger.is_empty());
    }
}
