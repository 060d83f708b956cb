//! Durable bookkeeping for live-query subscriptions.
//!
//! The registry keeps the authoritative in-memory state. A storage backend only
//! mirrors what is needed to answer keep-alive reconciliation, to expire
//! abandoned subscriptions, and to persist last-sent snapshots.

use crate::diff::Snapshot;
use crate::error::Result;
use crate::query::{Query, SubscriptionKey};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct StoredSubscription {
    pub key: SubscriptionKey,
    pub query: Query,
}

#[async_trait]
pub trait SubscriptionStorage: Send + Sync {
    async fn add(&self, record: StoredSubscription) -> Result<()>;

    async fn remove(&self, key: &SubscriptionKey) -> Result<()>;

    /// Persistence hook called after a snapshot was delivered.
    async fn save_snapshot(&self, key: &SubscriptionKey, snapshot: &Snapshot) -> Result<()>;

    /// Refreshes every record whose subscription key or client id is listed
    /// and returns the ids that matched nothing.
    async fn keep_alive_and_return_unknown_ids(&self, ids: &[String]) -> Result<Vec<String>>;

    /// Keys of records not kept alive within `idle`.
    async fn expired(&self, idle: Duration) -> Result<Vec<SubscriptionKey>>;
}

struct Entry {
    record: StoredSubscription,
    snapshot: Option<Snapshot>,
    last_used: Instant,
}

#[derive(Default)]
pub struct InMemorySubscriptionStorage {
    entries: DashMap<SubscriptionKey, Entry>,
}

impl InMemorySubscriptionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self, key: &SubscriptionKey) -> Option<Snapshot> {
        self.entries.get(key).and_then(|e| e.snapshot.clone())
    }
}

#[async_trait]
impl SubscriptionStorage for InMemorySubscriptionStorage {
    async fn add(&self, record: StoredSubscription) -> Result<()> {
        self.entries.insert(
            record.key.clone(),
            Entry {
                record,
                snapshot: None,
                last_used: Instant::now(),
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &SubscriptionKey) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn save_snapshot(&self, key: &SubscriptionKey, snapshot: &Snapshot) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.snapshot = Some(snapshot.clone());
        }
        Ok(())
    }

    async fn keep_alive_and_return_unknown_ids(&self, ids: &[String]) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut unknown = Vec::new();

        for id in ids {
            let mut matched = false;
            for mut entry in self.entries.iter_mut() {
                let record = &entry.record;
                if record.key.client_id == *id || record.key.to_string() == *id {
                    entry.last_used = now;
                    matched = true;
                }
            }
            if !matched {
                unknown.push(id.clone());
            }
        }

        Ok(unknown)
    }

    async fn expired(&self, idle: Duration) -> Result<Vec<SubscriptionKey>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.last_used.elapsed() > idle)
            .map(|e| e.record.key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(client: &str, query: &str) -> StoredSubscription {
        StoredSubscription {
            key: SubscriptionKey::new(client, query),
            query: Query::new("tasks"),
        }
    }

    #[tokio::test]
    async fn test_keep_alive_matches_client_and_key() {
        let storage = InMemorySubscriptionStorage::new();
        storage.add(record("c1", "q1")).await.unwrap();
        storage.add(record("c2", "q2")).await.unwrap();

        let unknown = storage
            .keep_alive_and_return_unknown_ids(&[
                "c1".to_string(),
                "c2:q2".to_string(),
                "c9".to_string(),
            ])
            .await
            .unwrap();

        assert_eq!(unknown, vec!["c9".to_string()]);
    }

    #[tokio::test]
    async fn test_expired_after_idle() {
        let storage = InMemorySubscriptionStorage::new();
        storage.add(record("c1", "q1")).await.unwrap();

        assert!(storage.expired(Duration::from_secs(60)).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let expired = storage.expired(Duration::from_millis(5)).await.unwrap();
        assert_eq!(expired, vec![SubscriptionKey::new("c1", "q1")]);

        storage.remove(&expired[0]).await.unwrap();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_save_snapshot_only_for_known_keys() {
        let storage = InMemorySubscriptionStorage::new();
        storage.add(record("c1", "q1")).await.unwrap();

        let snapshot = Snapshot::default();
        storage
            .save_snapshot(&SubscriptionKey::new("c1", "q1"), &snapshot)
            .await
            .unwrap();
        storage
            .save_snapshot(&SubscriptionKey::new("c1", "missing"), &snapshot)
            .await
            .unwrap();

        assert!(storage.snapshot(&SubscriptionKey::new("c1", "q1")).is_some());
        assert_eq!(storage.len(), 1);
    }
}
