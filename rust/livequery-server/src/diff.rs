//! Diff engine: re-runs a live query and turns the difference between the
//! last delivered snapshot and the fresh result into add/replace/remove deltas.
//!
//! Rows are matched by primary key. A row whose position changed but whose
//! fields did not produces no message; clients keep order themselves from the
//! query's sort. Recomputes for one subscription never overlap: a trigger that
//! arrives mid-run is coalesced into a single follow-up run.

use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::message::{LiveQueryMessage, OutboundMessage};
use crate::query::Query;
use crate::registry::LiveQuerySubscription;
use crate::storage::SubscriptionStorage;
use crate::store::{DataStore, EntityCatalog, EntityDefinition};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, debug_span, warn, Instrument};

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub id: String,
    pub row: Value,
}

/// Ordered rows last delivered to the client
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub rows: Vec<SnapshotRow>,
}

impl Snapshot {
    pub fn from_rows(definition: &EntityDefinition, rows: Vec<Value>) -> Self {
        let rows = rows
            .into_iter()
            .filter_map(|row| match definition.id_of(&row) {
                Some(id) => Some(SnapshotRow { id, row }),
                None => {
                    debug!("Skipping {} row without primary key", definition.key);
                    None
                }
            })
            .collect();
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.rows.iter().map(|r| r.id.as_str()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.rows.iter().map(|r| r.row.clone()).collect()
    }
}

/// Minimal message set turning `old` into `new`: removals first, then adds and
/// replaces in the new result order.
pub fn diff(old: &Snapshot, new: &Snapshot) -> Vec<LiveQueryMessage> {
    let previous: HashMap<&str, &Value> = old
        .rows
        .iter()
        .map(|r| (r.id.as_str(), &r.row))
        .collect();
    let current: HashSet<&str> = new.rows.iter().map(|r| r.id.as_str()).collect();

    let mut messages = Vec::new();

    for row in &old.rows {
        if !current.contains(row.id.as_str()) {
            messages.push(LiveQueryMessage::Remove { id: row.id.clone() });
        }
    }

    for row in &new.rows {
        match previous.get(row.id.as_str()) {
            None => messages.push(LiveQueryMessage::Add(row.row.clone())),
            Some(last_sent) if **last_sent != row.row => {
                messages.push(LiveQueryMessage::Replace {
                    old_id: row.id.clone(),
                    item: row.row.clone(),
                })
            }
            Some(_) => {}
        }
    }

    messages
}

/// Result of one recompute, not yet delivered
#[derive(Debug, Clone)]
pub struct Recomputed {
    pub messages: Vec<OutboundMessage>,
    pub snapshot: Snapshot,
}

pub struct DiffEngine {
    store: Arc<dyn DataStore>,
    catalog: Arc<EntityCatalog>,
    connections: ConnectionManager,
    storage: Arc<dyn SubscriptionStorage>,
}

impl DiffEngine {
    pub fn new(
        store: Arc<dyn DataStore>,
        catalog: Arc<EntityCatalog>,
        connections: ConnectionManager,
        storage: Arc<dyn SubscriptionStorage>,
    ) -> Self {
        Self {
            store,
            catalog,
            connections,
            storage,
        }
    }

    /// Runs the query through the data store and keys the rows by identity.
    pub async fn materialize(&self, query: &Query) -> Result<Snapshot> {
        let definition = self.catalog.get(&query.entity_key)?;
        let rows = self.store.find(query).await?;
        Ok(Snapshot::from_rows(definition, rows))
    }

    /// Re-executes the subscription's query and diffs it against the snapshot.
    pub async fn recompute(&self, subscription: &LiveQuerySubscription) -> Result<Recomputed> {
        let snapshot = self.materialize(&subscription.query).await?;
        let key = subscription.key.to_string();
        let messages = diff(&subscription.snapshot(), &snapshot)
            .into_iter()
            .map(|m| OutboundMessage::live(key.clone(), m))
            .collect();
        Ok(Recomputed { messages, snapshot })
    }

    /// One recompute-and-deliver pass. The snapshot is swapped only after the
    /// batch was handed to the connection.
    pub async fn run_once(&self, subscription: &LiveQuerySubscription) -> Result<usize> {
        let Recomputed { messages, snapshot } = self.recompute(subscription).await?;
        if messages.is_empty() || subscription.is_cancelled() {
            return Ok(0);
        }

        self.connections
            .write_batch(&subscription.key.client_id, &messages)?;
        subscription.replace_snapshot(snapshot.clone());

        if let Err(e) = self.storage.save_snapshot(&subscription.key, &snapshot).await {
            warn!("Failed to persist snapshot for {}: {}", subscription.key, e);
        }
        Ok(messages.len())
    }

    /// Queues a recompute without waiting for it.
    pub fn schedule(self: &Arc<Self>, subscription: Arc<LiveQuerySubscription>) {
        if !subscription.request_run() {
            debug!("Recompute for {} coalesced", subscription.key);
            return;
        }
        self.spawn_drain(subscription);
    }

    /// Starts a worker for a subscription whose run slot the caller already
    /// holds.
    pub(crate) fn schedule_follow_up(self: &Arc<Self>, subscription: Arc<LiveQuerySubscription>) {
        self.spawn_drain(subscription);
    }

    fn spawn_drain(self: &Arc<Self>, subscription: Arc<LiveQuerySubscription>) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime, recompute for {} skipped", subscription.key);
                subscription.abandon_run();
                return;
            }
        };

        let engine = self.clone();
        let span = debug_span!("livequery.recompute", key = %subscription.key);
        handle.spawn(async move { engine.drain(subscription).await }.instrument(span));
    }

    async fn drain(&self, subscription: Arc<LiveQuerySubscription>) {
        loop {
            if !subscription.is_cancelled() {
                match self.run_once(&subscription).await {
                    Ok(0) => {}
                    Ok(n) => debug!("Delivered {} delta(s) to {}", n, subscription.key),
                    Err(e) if e.is_transport() => {
                        debug!("Delivery to {} deferred: {}", subscription.key, e)
                    }
                    Err(e) => warn!("Recompute for {} failed: {}", subscription.key, e),
                }
            }

            if !subscription.finish_run() {
                break;
            }
        }
    }
}
