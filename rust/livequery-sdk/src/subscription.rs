//! Local bookkeeping of everything the client is subscribed to.
//!
//! Entries are keyed by local ids that survive reconnects; the server-side
//! subscription key is rebound every time the query is reissued. Listeners of
//! identical queries share one server subscription, like channel listeners
//! share one membership.

use crate::frame::{Envelope, LiveQueryMessage};
use crate::query::Query;
use crate::view::LiveView;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

pub type QueryCallback = Arc<dyn Fn(&[Value], &LiveQueryMessage) + Send + Sync>;
pub type ChannelCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Messages kept per unbound key while its subscribe call is in flight
const MAX_PENDING: usize = 1000;

/// One server-side query shared by every local listener of an identical
/// `Query`.
pub(crate) struct QueryEntry {
    pub query: Query,
    pub view: LiveView,
    pub listeners: BTreeMap<u64, QueryCallback>,
    pub server_key: Option<String>,
    /// An `all` has been applied to the view
    loaded: bool,
}

/// A listener registered through [`SubscriptionTable::add_query`].
pub(crate) struct QueryListener {
    pub listener: u64,
    pub group: u64,
    /// No other listener had this query; the caller issues it to the server.
    pub first: bool,
    /// Current items for a listener joining an already loaded query
    pub initial: Option<Delivery>,
}

/// Outcome of [`SubscriptionTable::remove_query`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ReleasedQuery {
    /// The last listener left; the server subscription can go.
    pub last: bool,
    pub server_key: Option<String>,
}

pub(crate) struct ChannelEntry {
    pub channel: String,
    pub callback: ChannelCallback,
}

/// A callback invocation prepared under the table lock and run after it is
/// released.
pub(crate) enum Delivery {
    Query {
        callback: QueryCallback,
        items: Vec<Value>,
        message: LiveQueryMessage,
    },
    Channel {
        callback: ChannelCallback,
        payload: Value,
    },
}

impl Delivery {
    pub fn deliver(self) {
        match self {
            Delivery::Query {
                callback,
                items,
                message,
            } => callback(&items, &message),
            Delivery::Channel { callback, payload } => callback(&payload),
        }
    }
}

#[derive(Default)]
pub(crate) struct SubscriptionTable {
    next_id: u64,
    /// Query groups by group id
    queries: HashMap<u64, QueryEntry>,
    /// Listener id to group id
    listeners: HashMap<u64, u64>,
    by_key: HashMap<String, u64>,
    channels: HashMap<u64, ChannelEntry>,
    pending: HashMap<String, Vec<LiveQueryMessage>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Adds a listener, joining the group of an identical query when one
    /// exists.
    pub fn add_query(&mut self, query: Query, callback: QueryCallback) -> QueryListener {
        let listener = self.allocate();

        if let Some((&group, entry)) = self.queries.iter_mut().find(|(_, e)| e.query == query) {
            entry.listeners.insert(listener, callback.clone());
            let initial = entry.loaded.then(|| {
                let items = entry.view.rows().to_vec();
                Delivery::Query {
                    callback,
                    message: LiveQueryMessage::All(items.clone()),
                    items,
                }
            });
            self.listeners.insert(listener, group);
            return QueryListener {
                listener,
                group,
                first: false,
                initial,
            };
        }

        let group = self.allocate();
        let mut view = LiveView::new(query.sort.clone());
        if let Some(field) = &query.id_field {
            view = view.with_id_field(field.clone());
        }
        self.queries.insert(
            group,
            QueryEntry {
                query,
                view,
                listeners: BTreeMap::from([(listener, callback)]),
                server_key: None,
                loaded: false,
            },
        );
        self.listeners.insert(listener, group);
        QueryListener {
            listener,
            group,
            first: true,
            initial: None,
        }
    }

    pub fn contains_query(&self, group: u64) -> bool {
        self.queries.contains_key(&group)
    }

    pub fn rows(&self, listener: u64) -> Option<Vec<Value>> {
        let group = self.listeners.get(&listener)?;
        self.queries.get(group).map(|entry| entry.view.rows().to_vec())
    }

    /// Drops one listener. The group goes with its last listener.
    pub fn remove_query(&mut self, listener: u64) -> Option<ReleasedQuery> {
        let group = self.listeners.remove(&listener)?;
        let entry = self.queries.get_mut(&group)?;
        entry.listeners.remove(&listener);
        if !entry.listeners.is_empty() {
            return Some(ReleasedQuery {
                last: false,
                server_key: entry.server_key.clone(),
            });
        }

        let entry = self.queries.remove(&group)?;
        if let Some(key) = &entry.server_key {
            self.by_key.remove(key);
            self.pending.remove(key);
        }
        Some(ReleasedQuery {
            last: true,
            server_key: entry.server_key,
        })
    }

    /// Associates a query group with the key the server assigned and applies
    /// any messages that arrived for that key before the binding.
    pub fn bind_key(&mut self, group: u64, key: String) -> Vec<Delivery> {
        let Some(entry) = self.queries.get_mut(&group) else {
            return Vec::new();
        };
        if let Some(previous) = entry.server_key.replace(key.clone()) {
            if previous != key {
                self.by_key.remove(&previous);
            }
        }
        self.by_key.insert(key.clone(), group);

        self.pending
            .remove(&key)
            .unwrap_or_default()
            .into_iter()
            .flat_map(|message| apply(entry, message))
            .collect()
    }

    /// Forgets a server key the server no longer recognizes.
    pub fn unbind_key(&mut self, key: &str) -> Option<(u64, Query)> {
        let group = self.by_key.remove(key)?;
        let entry = self.queries.get_mut(&group)?;
        entry.server_key = None;
        Some((group, entry.query.clone()))
    }

    /// Drops every server binding; used when a new connection starts.
    pub fn reset_keys(&mut self) {
        self.by_key.clear();
        self.pending.clear();
        for entry in self.queries.values_mut() {
            entry.server_key = None;
        }
    }

    pub fn queries(&self) -> Vec<(u64, Query)> {
        let mut queries: Vec<(u64, Query)> = self
            .queries
            .iter()
            .map(|(group, entry)| (*group, entry.query.clone()))
            .collect();
        queries.sort_by_key(|(group, _)| *group);
        queries
    }

    pub fn server_keys(&self) -> Vec<String> {
        self.by_key.keys().cloned().collect()
    }

    /// Returns the local id and whether it is the first listener of `channel`.
    pub fn add_channel(&mut self, channel: &str, callback: ChannelCallback) -> (u64, bool) {
        let first = !self.channels.values().any(|c| c.channel == channel);
        let local = self.allocate();
        self.channels.insert(
            local,
            ChannelEntry {
                channel: channel.to_string(),
                callback,
            },
        );
        (local, first)
    }

    /// Returns the channel name and whether its last listener just left.
    pub fn remove_channel(&mut self, local: u64) -> Option<(String, bool)> {
        let entry = self.channels.remove(&local)?;
        let last = !self.channels.values().any(|c| c.channel == entry.channel);
        Some((entry.channel, last))
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.values().map(|c| c.channel.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Routes one envelope. Live-query keys take precedence over channel
    /// names; a key of this connection that is not bound yet is buffered.
    pub fn dispatch(&mut self, envelope: Envelope, connection_id: &str) -> Vec<Delivery> {
        if let Some(group) = self.by_key.get(&envelope.channel).copied() {
            let Some(message) = parse_message(envelope.data) else {
                return Vec::new();
            };
            return match self.queries.get_mut(&group) {
                Some(entry) => apply(entry, message),
                None => Vec::new(),
            };
        }

        let listeners: Vec<Delivery> = self
            .channels
            .values()
            .filter(|c| c.channel == envelope.channel)
            .map(|c| Delivery::Channel {
                callback: c.callback.clone(),
                payload: envelope.data.clone(),
            })
            .collect();
        if !listeners.is_empty() {
            return listeners;
        }

        let own_key = envelope
            .channel
            .strip_prefix(connection_id)
            .is_some_and(|rest| rest.starts_with(':'));
        if own_key {
            if let Some(message) = parse_message(envelope.data) {
                let queue = self.pending.entry(envelope.channel).or_default();
                if queue.len() < MAX_PENDING {
                    queue.push(message);
                }
            }
        } else {
            debug!("No listener for {}", envelope.channel);
        }
        Vec::new()
    }
}

fn apply(entry: &mut QueryEntry, message: LiveQueryMessage) -> Vec<Delivery> {
    entry.view.apply(&message);
    if let LiveQueryMessage::All(_) = message {
        entry.loaded = true;
    }
    let items = entry.view.rows().to_vec();
    entry
        .listeners
        .values()
        .map(|callback| Delivery::Query {
            callback: callback.clone(),
            items: items.clone(),
            message: message.clone(),
        })
        .collect()
}

fn parse_message(data: Value) -> Option<LiveQueryMessage> {
    match serde_json::from_value(data) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!("Dropping malformed live query message: {}", e);
            None
        }
    }
}
