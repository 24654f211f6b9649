//! Replay protection for terminal tokens.
//!
//! Every issued nonce is registered with a TTL slightly longer than the
//! token's validity window. Verification only peeks; consumption takes the
//! entry atomically, so of two concurrent scans of one token exactly one
//! wins.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use punchclock_core::Clock;
use tokio::sync::Mutex;

/// What is known about a live nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceEntry {
    /// Public id of the terminal the nonce was issued for.
    pub terminal_id: String,
    /// Unix time after which the entry is gone.
    pub expires_at: i64,
}

/// Short-lived nonce registry with atomic take.
#[async_trait]
pub trait NonceStore: Send + Sync {
    async fn set_with_ttl(&self, nonce: &str, terminal_id: &str, ttl_secs: i64);

    /// Live entry for `nonce`, if any. Expired entries are invisible.
    async fn get(&self, nonce: &str) -> Option<NonceEntry>;

    async fn delete(&self, nonce: &str) -> bool;

    /// Remove and return a live entry in one step.
    async fn take(&self, nonce: &str) -> Option<NonceEntry>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> usize;

    /// Number of stored entries, expired ones included until purged.
    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// In-process [`NonceStore`].
pub struct MemoryNonceStore {
    entries: Mutex<HashMap<String, NonceEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryNonceStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl NonceStore for MemoryNonceStore {
    async fn set_with_ttl(&self, nonce: &str, terminal_id: &str, ttl_secs: i64) {
        let entry = NonceEntry {
            terminal_id: terminal_id.to_string(),
            expires_at: self.clock.now() + ttl_secs,
        };
        self.entries.lock().await.insert(nonce.to_string(), entry);
    }

    async fn get(&self, nonce: &str) -> Option<NonceEntry> {
        let now = self.clock.now();
        self.entries
            .lock()
            .await
            .get(nonce)
            .filter(|e| e.expires_at > now)
            .cloned()
    }

    async fn delete(&self, nonce: &str) -> bool {
        self.entries.lock().await.remove(nonce).is_some()
    }

    async fn take(&self, nonce: &str) -> Option<NonceEntry> {
        let now = self.clock.now();
        self.entries
            .lock()
            .await
            .remove(nonce)
            .filter(|e| e.expires_at > now)
    }

    async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use punchclock_core::FixedClock;

    fn store() -> (FixedClock, MemoryNonceStore) {
        let clock = FixedClock::new(1_000);
        let store = MemoryNonceStore::new(Arc::new(clock.clone()));
        (clock, store)
    }

    #[tokio::test]
    async fn take_is_single_use() {
        let (_, store) = store();
        store.set_with_ttl("n1", "term", 90).await;

        assert!(store.get("n1").await.is_some());
        assert!(store.get("n1").await.is_some(), "get must not consume");
        let entry = store.take("n1").await.unwrap();
        assert_eq!(entry.terminal_id, "term");
        assert!(store.take("n1").await.is_none());
        assert!(store.get("n1").await.is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_invisible_and_purged() {
        let (clock, store) = store();
        store.set_with_ttl("short", "term", 10).await;
        store.set_with_ttl("long", "term", 100).await;

        clock.advance(10);
        assert!(store.get("short").await.is_none());
        assert!(store.take("short").await.is_none());
        assert!(store.get("long").await.is_some());

        store.set_with_ttl("short2", "term", 5).await;
        clock.advance(5);
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let (_, store) = store();
        store.set_with_ttl("n1", "term", 60).await;
        assert!(store.delete("n1").await);
        assert!(!store.delete("n1").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_takes_have_one_winner() {
        let (_, store) = store();
        let store = Arc::new(store);
        store.set_with_ttl("contested", "term", 60).await;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.take("contested").await.is_some() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
