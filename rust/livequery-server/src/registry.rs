use crate::auth::{AuthContext, Principal};
use crate::channel::{ChannelPublisher, ChannelSubscribeOutcome};
use crate::connection::ConnectionManager;
use crate::diff::{DiffEngine, Snapshot};
use crate::error::{LiveQueryError, Result};
use crate::message::{LiveQueryMessage, OutboundMessage};
use crate::query::{Query, SubscriptionKey};
use crate::storage::{StoredSubscription, SubscriptionStorage};
use crate::store::{ChangeHint, DataStore, EntityCatalog, MutationHook};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const RUNNING_DIRTY: u8 = 2;

/// One client's interest in the result set of a query.
#[derive(Debug)]
pub struct LiveQuerySubscription {
    pub key: SubscriptionKey,
    pub query: Query,
    snapshot: Mutex<Snapshot>,
    run_state: AtomicU8,
    cancelled: AtomicBool,
}

impl LiveQuerySubscription {
    fn new(key: SubscriptionKey, query: Query) -> Self {
        Self {
            key,
            query,
            snapshot: Mutex::new(Snapshot::default()),
            // owned by the subscribing call until the initial snapshot is sent
            run_state: AtomicU8::new(RUNNING),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Last delivered snapshot
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.lock().clone()
    }

    pub(crate) fn replace_snapshot(&self, snapshot: Snapshot) {
        *self.snapshot.lock() = snapshot;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true when the caller must start a worker; otherwise the
    /// running worker is told to go around once more.
    pub(crate) fn request_run(&self) -> bool {
        let mut current = self.run_state.load(Ordering::Acquire);
        loop {
            let next = if current == IDLE { RUNNING } else { RUNNING_DIRTY };
            match self.run_state.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current == IDLE,
                Err(actual) => current = actual,
            }
        }
    }

    /// Ends a run. Returns true when a trigger arrived meanwhile and the worker
    /// must run again.
    pub(crate) fn finish_run(&self) -> bool {
        match self.run_state.compare_exchange(
            RUNNING,
            IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => false,
            Err(_) => {
                self.run_state.store(RUNNING, Ordering::Release);
                true
            }
        }
    }

    pub(crate) fn abandon_run(&self) {
        self.run_state.store(IDLE, Ordering::Release);
    }
}

/// Live-query subscriptions keyed by `(client_id, query_id)` and indexed by
/// entity. All bookkeeping here is synchronous; only data-store reads and the
/// storage collaborator are awaited.
pub struct SubscriptionRegistry {
    subscriptions: DashMap<SubscriptionKey, Arc<LiveQuerySubscription>>,
    by_entity: DashMap<String, HashSet<SubscriptionKey>>,
    catalog: Arc<EntityCatalog>,
    connections: ConnectionManager,
    channels: ChannelPublisher,
    storage: Arc<dyn SubscriptionStorage>,
    diff: Arc<DiffEngine>,
}

impl SubscriptionRegistry {
    pub fn new(
        store: Arc<dyn DataStore>,
        catalog: Arc<EntityCatalog>,
        connections: ConnectionManager,
        channels: ChannelPublisher,
        storage: Arc<dyn SubscriptionStorage>,
    ) -> Self {
        let diff = Arc::new(DiffEngine::new(
            store,
            catalog.clone(),
            connections.clone(),
            storage.clone(),
        ));
        Self {
            subscriptions: DashMap::new(),
            by_entity: DashMap::new(),
            catalog,
            connections,
            channels,
            storage,
            diff,
        }
    }

    pub fn diff_engine(&self) -> &Arc<DiffEngine> {
        &self.diff
    }

    /// Hook for a data store's write path. Holds the registry weakly so the
    /// store does not keep it alive.
    pub fn mutation_hook(self: &Arc<Self>) -> MutationHook {
        let registry = Arc::downgrade(self);
        Arc::new(move |entity_key: &str, hint: ChangeHint| {
            if let Some(registry) = registry.upgrade() {
                registry.notify_mutation(entity_key, hint);
            }
        })
    }

    /// Registers the query for `client_id` and sends its initial `all` message.
    pub async fn subscribe(
        &self,
        client_id: &str,
        query: Query,
        principal: &Principal,
    ) -> Result<SubscriptionKey> {
        if !self.connections.is_open(client_id) {
            return Err(LiveQueryError::NotFound(format!("connection {}", client_id)));
        }
        let definition = self.catalog.get(&query.entity_key)?;
        if !definition
            .read
            .allowed(principal, &AuthContext::Entity(&query.entity_key))
        {
            return Err(LiveQueryError::Authorization(format!(
                "read on {}",
                query.entity_key
            )));
        }

        let key = SubscriptionKey::new(client_id, query.query_id());
        let subscription = Arc::new(LiveQuerySubscription::new(key.clone(), query.clone()));

        // Registered before the first read so no mutation falls in between.
        self.insert(subscription.clone());

        let snapshot = match self.diff.materialize(&query).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.detach(&key);
                return Err(e);
            }
        };

        if let Err(e) = self
            .storage
            .add(StoredSubscription {
                key: key.clone(),
                query,
            })
            .await
        {
            warn!("Failed to store subscription {}: {}", key, e);
        }

        let initial = OutboundMessage::live(key.to_string(), LiveQueryMessage::All(snapshot.values()));
        match self.connections.write(client_id, &initial) {
            Ok(()) => subscription.replace_snapshot(snapshot),
            // an empty baseline makes the catch-up diff resend every row
            Err(e) => warn!("Initial snapshot for {} not delivered: {}", key, e),
        }

        info!("Client {} subscribed to {}", client_id, key);

        if subscription.finish_run() {
            self.diff.schedule_follow_up(subscription);
        }
        Ok(key)
    }

    fn insert(&self, subscription: Arc<LiveQuerySubscription>) {
        let key = subscription.key.clone();
        self.by_entity
            .entry(subscription.query.entity_key.clone())
            .or_default()
            .insert(key.clone());
        if let Some(previous) = self.subscriptions.insert(key, subscription) {
            previous.cancel();
        }
    }

    fn detach(&self, key: &SubscriptionKey) -> Option<Arc<LiveQuerySubscription>> {
        let (_, subscription) = self.subscriptions.remove(key)?;
        subscription.cancel();
        if let Some(mut keys) = self.by_entity.get_mut(&subscription.query.entity_key) {
            keys.remove(key);
        }
        self.by_entity
            .remove_if(&subscription.query.entity_key, |_, keys| keys.is_empty());
        Some(subscription)
    }

    /// Idempotent; returns whether anything was removed.
    pub async fn unsubscribe(&self, key: &SubscriptionKey) -> bool {
        let removed = self.detach(key).is_some();
        if let Err(e) = self.storage.remove(key).await {
            warn!("Failed to drop stored subscription {}: {}", key, e);
        }
        if removed {
            info!("Unsubscribed {}", key);
        }
        removed
    }

    pub async fn unsubscribe_client(&self, client_id: &str) -> usize {
        let keys: Vec<SubscriptionKey> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.key().client_id == client_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in keys {
            if self.unsubscribe(&key).await {
                removed += 1;
            }
        }
        removed
    }

    pub fn subscribe_channel(
        &self,
        client_id: &str,
        channel: &str,
        principal: &Principal,
    ) -> ChannelSubscribeOutcome {
        self.channels.subscribe_to_channel(client_id, channel, principal)
    }

    pub fn unsubscribe_channel(
        &self,
        client_id: &str,
        channel: &str,
        principal: &Principal,
    ) -> ChannelSubscribeOutcome {
        self.channels
            .unsubscribe_from_channel(client_id, channel, principal)
    }

    /// Fan-out entry point for the data-access layer. Never awaits; the
    /// recomputes run on their own tasks.
    pub fn notify_mutation(&self, entity_key: &str, hint: ChangeHint) {
        let keys: Vec<SubscriptionKey> = match self.by_entity.get(entity_key) {
            Some(keys) => keys.iter().cloned().collect(),
            None => return,
        };

        debug!(
            "Mutation on {} ({:?}) affects {} subscription(s)",
            entity_key,
            hint,
            keys.len()
        );

        for key in keys {
            if let Some(subscription) = self.subscriptions.get(&key).map(|s| s.value().clone()) {
                self.diff.schedule(subscription);
            }
        }
    }

    /// Recomputes every subscription of a reconnected client so it receives
    /// what it missed while away.
    pub fn resume(&self, client_id: &str) -> usize {
        let subscriptions: Vec<Arc<LiveQuerySubscription>> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.key().client_id == client_id)
            .map(|entry| entry.value().clone())
            .collect();

        let count = subscriptions.len();
        for subscription in subscriptions {
            self.diff.schedule(subscription);
        }
        if count > 0 {
            info!("Resuming {} subscription(s) for client {}", count, client_id);
        }
        count
    }

    pub fn has_client(&self, client_id: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|entry| entry.key().client_id == client_id)
    }

    /// Given identifiers the caller believes are alive, returns the ones the
    /// server no longer recognizes. Recognized ones are kept alive.
    pub async fn keep_alive_and_return_unknown_ids(&self, ids: &[String]) -> Result<Vec<String>> {
        let unknown_to_storage = self.storage.keep_alive_and_return_unknown_ids(ids).await?;

        Ok(unknown_to_storage
            .into_iter()
            .filter(|id| !self.connections.touch(id))
            .filter(|id| match SubscriptionKey::parse(id) {
                Some(key) => !self.subscriptions.contains_key(&key),
                None => true,
            })
            .collect())
    }

    /// Drops subscriptions not kept alive within `idle` whose client is gone.
    pub async fn purge_expired(&self, idle: Duration) -> Result<usize> {
        let mut purged = 0;
        for key in self.storage.expired(idle).await? {
            if self.connections.is_open(&key.client_id) {
                continue;
            }
            if self.unsubscribe(&key).await {
                purged += 1;
            }
        }
        Ok(purged)
    }

    pub fn get(&self, key: &SubscriptionKey) -> Option<Arc<LiveQuerySubscription>> {
        self.subscriptions.get(key).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn subscriptions_for(&self, entity_key: &str) -> usize {
        self.by_entity
            .get(entity_key)
            .map(|keys| keys.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DenyAll;
    use crate::connection::tests::next_frame;
    use crate::query::Filter;
    use crate::storage::InMemorySubscriptionStorage;
    use crate::store::{EntityDefinition, MemoryStore};
    use bytes::Bytes;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    struct Fixture {
        registry: Arc<SubscriptionRegistry>,
        store: Arc<MemoryStore>,
        connections: ConnectionManager,
    }

    fn fixture() -> Fixture {
        let catalog = Arc::new(
            EntityCatalog::new()
                .with_entity(EntityDefinition::new("tasks"))
                .with_entity(EntityDefinition::new("secrets").with_read(Arc::new(DenyAll))),
        );
        let store = Arc::new(MemoryStore::new(catalog.clone()));
        let connections = ConnectionManager::new();
        let registry = Arc::new(SubscriptionRegistry::new(
            store.clone(),
            catalog,
            connections.clone(),
            ChannelPublisher::new(connections.clone()),
            Arc::new(InMemorySubscriptionStorage::new()),
        ));
        store.set_mutation_hook(registry.mutation_hook());
        Fixture {
            registry,
            store,
            connections,
        }
    }

    async fn connect(connections: &ConnectionManager) -> (String, mpsc::Receiver<Bytes>) {
        let (tx, mut rx) = mpsc::channel(64);
        let conn = connections.open(tx);
        next_frame(&mut rx).await.unwrap();
        (conn.id, rx)
    }

    /// `data` objects of every message event in a frame
    fn messages(frame: &str) -> Vec<Value> {
        frame
            .split("\n\n")
            .filter(|event| event.starts_with("event:message"))
            .filter_map(|event| event.lines().find_map(|l| l.strip_prefix("data:")))
            .map(|data| serde_json::from_str::<Value>(data).unwrap()["data"].clone())
            .collect()
    }

    async fn quiet_messages(rx: &mut mpsc::Receiver<Bytes>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(Some(frame)) = timeout(Duration::from_millis(300), rx.recv()).await {
            out.extend(messages(&String::from_utf8_lossy(&frame)));
        }
        out
    }

    fn apply(view: &mut HashMap<String, Value>, message: &Value) {
        let id_of = |row: &Value| row["id"].to_string().trim_matches('"').to_string();
        match message["type"].as_str().unwrap() {
            "all" => {
                view.clear();
                for row in message["data"].as_array().unwrap() {
                    view.insert(id_of(row), row.clone());
                }
            }
            "add" => {
                view.insert(id_of(&message["data"]), message["data"].clone());
            }
            "replace" => {
                view.remove(message["data"]["oldId"].as_str().unwrap());
                let item = &message["data"]["item"];
                view.insert(id_of(item), item.clone());
            }
            "remove" => {
                view.remove(message["data"]["id"].as_str().unwrap());
            }
            other => panic!("unexpected message type {}", other),
        }
    }

    fn open_tasks() -> Query {
        Query::new("tasks").filter(Filter::eq("status", "open"))
    }

    #[tokio::test]
    async fn test_initial_snapshot_then_deltas() {
        let f = fixture();
        f.store.insert("tasks", json!({"id": 1, "status": "open"})).unwrap();
        f.store.insert("tasks", json!({"id": 2, "status": "open"})).unwrap();
        let (client, mut rx) = connect(&f.connections).await;

        let key = f
            .registry
            .subscribe(&client, open_tasks(), &Principal::anonymous())
            .await
            .unwrap();
        assert_eq!(key.client_id, client);

        let all = messages(&next_frame(&mut rx).await.unwrap());
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["type"], "all");
        assert_eq!(all[0]["data"].as_array().unwrap().len(), 2);

        f.store.insert("tasks", json!({"id": 3, "status": "open"})).unwrap();
        let added = messages(&next_frame(&mut rx).await.unwrap());
        assert_eq!(added, vec![json!({"type": "add", "data": {"id": 3, "status": "open"}})]);

        f.store.update("tasks", "1", json!({"status": "done"})).unwrap();
        let removed = messages(&next_frame(&mut rx).await.unwrap());
        assert_eq!(removed, vec![json!({"type": "remove", "data": {"id": "1"}})]);

        f.store.update("tasks", "2", json!({"title": "renamed"})).unwrap();
        let replaced = messages(&next_frame(&mut rx).await.unwrap());
        assert_eq!(replaced[0]["type"], "replace");
        assert_eq!(replaced[0]["data"]["oldId"], "2");
        assert_eq!(replaced[0]["data"]["item"]["title"], "renamed");
    }

    #[tokio::test]
    async fn test_unrelated_mutation_sends_nothing() {
        let f = fixture();
        let (client, mut rx) = connect(&f.connections).await;
        f.registry
            .subscribe(&client, open_tasks(), &Principal::anonymous())
            .await
            .unwrap();
        next_frame(&mut rx).await.unwrap();

        f.store.insert("tasks", json!({"id": 7, "status": "done"})).unwrap();
        assert!(quiet_messages(&mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_rejections() {
        let f = fixture();
        let anyone = Principal::anonymous();

        let err = f.registry.subscribe("ghost", open_tasks(), &anyone).await;
        assert!(matches!(err, Err(LiveQueryError::NotFound(_))));

        let (client, mut rx) = connect(&f.connections).await;
        let err = f.registry.subscribe(&client, Query::new("secrets"), &anyone).await;
        assert!(matches!(err, Err(LiveQueryError::Authorization(_))));

        let err = f.registry.subscribe(&client, Query::new("nope"), &anyone).await;
        assert!(matches!(err, Err(LiveQueryError::NotFound(_))));

        assert!(f.registry.is_empty());
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_read_on_subscribe_leaves_nothing_behind() {
        let f = fixture();
        let (client, _rx) = connect(&f.connections).await;
        f.store.fail_next_reads(1);

        let err = f
            .registry
            .subscribe(&client, open_tasks(), &Principal::anonymous())
            .await;
        assert!(matches!(err, Err(LiveQueryError::TransientStore(_))));
        assert!(f.registry.is_empty());
        assert_eq!(f.registry.subscriptions_for("tasks"), 0);
    }

    #[test]
    fn test_run_slot_coalesces_triggers() {
        let sub = LiveQuerySubscription::new(SubscriptionKey::new("c", "q"), open_tasks());
        // held by the subscribing call
        assert!(!sub.request_run());
        assert!(!sub.request_run());
        assert!(sub.finish_run());
        assert!(!sub.finish_run());

        assert!(sub.request_run());
        assert!(!sub.finish_run());
    }

    #[tokio::test]
    async fn test_burst_of_mutations_converges() {
        let f = fixture();
        let (client, mut rx) = connect(&f.connections).await;
        f.registry
            .subscribe(&client, open_tasks(), &Principal::anonymous())
            .await
            .unwrap();

        for id in 0..20 {
            f.store.insert("tasks", json!({"id": id, "status": "open"})).unwrap();
        }
        for id in 0..5 {
            f.store.delete("tasks", &id.to_string()).unwrap();
        }

        let mut view = HashMap::new();
        for message in quiet_messages(&mut rx).await {
            apply(&mut view, &message);
        }
        assert_eq!(view.len(), 15);
        assert!(!view.contains_key("0"));
        assert!(view.contains_key("19"));
    }

    #[tokio::test]
    async fn test_failed_recompute_keeps_snapshot() {
        let f = fixture();
        f.store.insert("tasks", json!({"id": 1, "status": "open"})).unwrap();
        let (client, mut rx) = connect(&f.connections).await;
        let key = f
            .registry
            .subscribe(&client, open_tasks(), &Principal::anonymous())
            .await
            .unwrap();
        next_frame(&mut rx).await.unwrap();

        f.store.fail_next_reads(1);
        f.store.insert("tasks", json!({"id": 2, "status": "open"})).unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(f.registry.get(&key).unwrap().snapshot().ids(), vec!["1"]);

        f.store.insert("tasks", json!({"id": 3, "status": "open"})).unwrap();
        let batch = messages(&next_frame(&mut rx).await.unwrap());
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|m| m["type"] == "add"));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let f = fixture();
        let (client, mut rx) = connect(&f.connections).await;
        let key = f
            .registry
            .subscribe(&client, open_tasks(), &Principal::anonymous())
            .await
            .unwrap();
        next_frame(&mut rx).await.unwrap();

        assert!(f.registry.unsubscribe(&key).await);
        assert!(!f.registry.unsubscribe(&key).await);

        f.store.insert("tasks", json!({"id": 1, "status": "open"})).unwrap();
        assert!(quiet_messages(&mut rx).await.is_empty());
        assert_eq!(f.registry.subscriptions_for("tasks"), 0);
    }

    #[tokio::test]
    async fn test_resume_delivers_missed_changes() {
        let f = fixture();
        f.store.insert("tasks", json!({"id": 1, "status": "open"})).unwrap();
        let (client, mut rx) = connect(&f.connections).await;
        f.registry
            .subscribe(&client, open_tasks(), &Principal::anonymous())
            .await
            .unwrap();

        let mut view = HashMap::new();
        for message in quiet_messages(&mut rx).await {
            apply(&mut view, &message);
        }

        f.connections.close(&client);
        f.store.insert("tasks", json!({"id": 2, "status": "open"})).unwrap();
        f.store.update("tasks", "1", json!({"status": "done"})).unwrap();
        sleep(Duration::from_millis(50)).await;

        let (tx, mut rx) = mpsc::channel(64);
        let resumed = f.connections.open_with_id(tx, client.clone());
        assert_eq!(resumed.id, client);
        assert!(next_frame(&mut rx).await.unwrap().starts_with("event:connectionId"));
        assert_eq!(f.registry.resume(&client), 1);

        for message in quiet_messages(&mut rx).await {
            apply(&mut view, &message);
        }
        let expected: Vec<String> = view.keys().cloned().collect();
        assert_eq!(expected, vec!["2".to_string()]);
    }

    #[tokio::test]
    async fn test_keep_alive_reports_unknown_ids() {
        let f = fixture();
        let (client, _rx) = connect(&f.connections).await;
        let key = f
            .registry
            .subscribe(&client, open_tasks(), &Principal::anonymous())
            .await
            .unwrap();

        let unknown = f
            .registry
            .keep_alive_and_return_unknown_ids(&[
                client.clone(),
                key.to_string(),
                "gone".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(unknown, vec!["gone".to_string()]);
    }

    #[tokio::test]
    async fn test_purge_skips_connected_clients() {
        let f = fixture();
        let (online, _rx1) = connect(&f.connections).await;
        let (offline, _rx2) = connect(&f.connections).await;
        let anyone = Principal::anonymous();
        f.registry.subscribe(&online, open_tasks(), &anyone).await.unwrap();
        f.registry.subscribe(&offline, open_tasks(), &anyone).await.unwrap();

        f.connections.close(&offline);
        sleep(Duration::from_millis(10)).await;

        assert_eq!(f.registry.purge_expired(Duration::ZERO).await.unwrap(), 1);
        assert!(f.registry.has_client(&online));
        assert!(!f.registry.has_client(&offline));
    }

    /// Blocks the next read until released.
    struct GatedStore {
        inner: Arc<MemoryStore>,
        armed: AtomicBool,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl DataStore for GatedStore {
        async fn find(&self, query: &Query) -> Result<Vec<Value>> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.find(query).await
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_during_recompute_suppresses_delivery() {
        let catalog = Arc::new(EntityCatalog::new().with_entity(EntityDefinition::new("tasks")));
        let inner = Arc::new(MemoryStore::new(catalog.clone()));
        let gated = Arc::new(GatedStore {
            inner: inner.clone(),
            armed: AtomicBool::new(false),
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let connections = ConnectionManager::new();
        let registry = Arc::new(SubscriptionRegistry::new(
            gated.clone(),
            catalog,
            connections.clone(),
            ChannelPublisher::new(connections.clone()),
            Arc::new(InMemorySubscriptionStorage::new()),
        ));
        inner.set_mutation_hook(registry.mutation_hook());

        let (client, mut rx) = connect(&connections).await;
        let key = registry
            .subscribe(&client, open_tasks(), &Principal::anonymous())
            .await
            .unwrap();
        next_frame(&mut rx).await.unwrap();

        gated.armed.store(true, Ordering::SeqCst);
        inner.insert("tasks", json!({"id": 1, "status": "open"})).unwrap();
        timeout(Duration::from_secs(1), gated.entered.notified())
            .await
            .unwrap();

        assert!(registry.unsubscribe(&key).await);
        gated.release.notify_one();

        assert!(quiet_messages(&mut rx).await.is_empty());
    }
}
