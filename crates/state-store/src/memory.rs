//! In-memory store with the same semantics as the Redis backend.
//!
//! Used as the fallback when no Redis is configured and as the store for
//! every test suite. TTLs are enforced lazily on read.

use crate::types::ScoredMember;
use crate::{StateStore, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Maps an `f64` score onto bits that sort in the same order, so members can
/// live in a `BTreeSet` without a float wrapper type.
fn ord_bits(score: f64) -> u64 {
    let bits = score.to_bits();
    if score >= 0.0 {
        bits | (1 << 63)
    } else {
        !bits
    }
}

#[derive(Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    order: BTreeSet<(u64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: String, score: f64) {
        if let Some(old) = self.scores.insert(member.clone(), score) {
            self.order.remove(&(ord_bits(old), member.clone()));
        }
        self.order.insert((ord_bits(score), member));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.order.remove(&(ord_bits(score), member.to_string()));
                true
            }
            None => false,
        }
    }
}

pub struct MemoryStore {
    kv: DashMap<String, Entry>,
    zsets: Mutex<HashMap<String, SortedSet>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            kv: DashMap::new(),
            zsets: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if let Some(entry) = self.kv.get(key) {
            if entry.expired() {
                drop(entry);
                self.kv.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.kv.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut out = Vec::new();
        for entry in self.kv.iter() {
            if entry.key().starts_with(prefix) && !entry.value().expired() {
                out.push(entry.key().clone());
            }
        }
        Ok(out)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut zsets = self.zsets.lock();
        zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut zsets = self.zsets.lock();
        Ok(zsets.get_mut(key).is_some_and(|set| set.remove(member)))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let zsets = self.zsets.lock();
        Ok(zsets.get(key).and_then(|set| set.scores.get(member).copied()))
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let zsets = self.zsets.lock();
        Ok(zsets.get(key).map(|set| set.scores.len() as u64).unwrap_or(0))
    }

    async fn ztop(&self, key: &str, count: usize) -> Result<Vec<ScoredMember>, StoreError> {
        let zsets = self.zsets.lock();
        let Some(set) = zsets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(set
            .order
            .iter()
            .rev()
            .take(count)
            .map(|(_, member)| ScoredMember::new(member.clone(), set.scores[member]))
            .collect())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        let zsets = self.zsets.lock();
        let Some(set) = zsets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(set
            .order
            .iter()
            .filter(|(_, member)| {
                let score = set.scores[member];
                score >= min && score <= max
            })
            .take(limit)
            .map(|(_, member)| ScoredMember::new(member.clone(), set.scores[member]))
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, StoreError> {
        let mut subs = self.subscribers.lock();
        let Some(senders) = subs.get_mut(channel) else {
            return Ok(0);
        };
        senders.retain(|tx| !tx.is_closed());
        let mut delivered = 0;
        for tx in senders.iter() {
            if tx.send(payload.to_string()).is_ok() {
                delivered += 1;
            }
        }
        debug!("Published to {} in-memory subscribers on {}", delivered, channel);
        Ok(delivered)
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<String>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("task:1", "{\"id\":1}", None).await.unwrap();
        assert_eq!(store.get("task:1").await.unwrap().unwrap(), "{\"id\":1}");
        assert!(store.delete("task:1").await.unwrap());
        assert!(store.get("task:1").await.unwrap().is_none());
        assert!(!store.delete("task:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .put("ephemeral", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.get("ephemeral").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("ephemeral").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keys_by_prefix() {
        let store = MemoryStore::new();
        store.put("agent:registration:a", "1", None).await.unwrap();
        store.put("agent:registration:b", "2", None).await.unwrap();
        store.put("task:c", "3", None).await.unwrap();
        let mut keys = store.keys("agent:registration:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["agent:registration:a", "agent:registration:b"]);
    }

    #[tokio::test]
    async fn test_ztop_orders_by_score_descending() {
        let store = MemoryStore::new();
        store.zadd("queue:main", "low", 1.0).await.unwrap();
        store.zadd("queue:main", "high", 4_000_000.0).await.unwrap();
        store.zadd("queue:main", "mid", 2_000_000.0).await.unwrap();

        let top = store.ztop("queue:main", 2).await.unwrap();
        assert_eq!(top[0].member, "high");
        assert_eq!(top[1].member, "mid");
        assert_eq!(store.zcard("queue:main").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_zadd_updates_existing_member() {
        let store = MemoryStore::new();
        store.zadd("z", "m", 1.0).await.unwrap();
        store.zadd("z", "m", 9.0).await.unwrap();
        assert_eq!(store.zcard("z").await.unwrap(), 1);
        assert_eq!(store.zscore("z", "m").await.unwrap(), Some(9.0));
    }

    #[tokio::test]
    async fn test_zrange_by_score_window() {
        let store = MemoryStore::new();
        for (member, score) in [("a", 10.0), ("b", 20.0), ("c", 30.0)] {
            store.zadd("delayed", member, score).await.unwrap();
        }
        let ripe = store
            .zrange_by_score("delayed", 0.0, 20.0, 10)
            .await
            .unwrap();
        assert_eq!(ripe.len(), 2);
        assert_eq!(ripe[0].member, "a");
        assert_eq!(ripe[1].member, "b");
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("events").await.unwrap();
        let delivered = store.publish("events", "hello").await.unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }
}
