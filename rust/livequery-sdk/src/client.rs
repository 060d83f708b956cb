use crate::config::ClientConfig;
use crate::connection::{spawn_connection_loop, ConnectionState, Shared};
use crate::error::{ClientError, Result};
use crate::frame::LiveQueryMessage;
use crate::query::Query;
use crate::subscription::ReleasedQuery;
use crate::transport::{HttpTransport, StreamTransport};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for one server. Owns a single event stream that carries every
/// live query and channel subscribed through it, and reissues them after a
/// reconnect.
pub struct LiveQueryClient {
    shared: Arc<Shared>,
    config: ClientConfig,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LiveQueryClient {
    /// Starts the connection loop. Returns immediately; use
    /// [`wait_until_open`](Self::wait_until_open) to wait for the stream.
    pub fn connect(transport: Arc<dyn StreamTransport>, config: ClientConfig) -> Self {
        let shared = Arc::new(Shared::new(transport));
        let task = spawn_connection_loop(shared.clone(), config.clone());
        Self {
            shared,
            config,
            task: Mutex::new(Some(task)),
        }
    }

    /// Connects over HTTP to a server whose stream routes live under
    /// `base_url`, e.g. `http://localhost:8878/api`.
    pub fn connect_http(base_url: impl Into<String>, config: ClientConfig) -> Self {
        Self::connect(Arc::new(HttpTransport::new(base_url)), config)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub async fn wait_until_open(&self) -> Result<()> {
        let mut changes = self.shared.state.subscribe();
        loop {
            let state = *changes.borrow_and_update();
            match state {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Failed => {
                    return Err(ClientError::MaxReconnectAttempts(
                        self.config.max_reconnect_attempts,
                    ))
                }
                ConnectionState::Closed => return Err(ClientError::ConnectionClosed),
                ConnectionState::Opening | ConnectionState::Reconnecting { .. } => {}
            }
            changes
                .changed()
                .await
                .map_err(|_| ClientError::ConnectionClosed)?;
        }
    }

    /// Identifier the server assigned to the current stream
    pub async fn connection_id(&self) -> Option<String> {
        self.shared.connection_id().await
    }

    /// Subscribes to a live query. `callback` receives the full, sorted item
    /// list after every change together with the message that caused it.
    ///
    /// Identical queries share one server subscription; a listener joining a
    /// loaded one is called right away with the current items.
    ///
    /// While disconnected the subscription is only recorded and is issued
    /// once the stream opens.
    pub async fn subscribe<F>(&self, query: Query, callback: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&[Value], &LiveQueryMessage) + Send + Sync + 'static,
    {
        let added = self
            .shared
            .table
            .lock()
            .await
            .add_query(query.clone(), Arc::new(callback));
        if let Some(initial) = added.initial {
            initial.deliver();
        }

        if added.first {
            if let Some(connection_id) = self.shared.connection_id().await {
                if let Err(e) = self
                    .shared
                    .subscribe_query(&connection_id, added.group, &query)
                    .await
                {
                    self.shared.table.lock().await.remove_query(added.listener);
                    return Err(e);
                }
            } else {
                debug!("Not connected, {} query deferred", query.entity_key);
            }
        }

        Ok(SubscriptionHandle {
            shared: self.shared.clone(),
            target: Target::Query(added.listener),
        })
    }

    /// Listens on a named channel. Several listeners of one channel share a
    /// single server-side membership.
    pub async fn subscribe_channel<F>(
        &self,
        channel: impl Into<String>,
        callback: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let channel = channel.into();
        let (local, first) = self
            .shared
            .table
            .lock()
            .await
            .add_channel(&channel, Arc::new(callback));

        if first {
            if let Some(connection_id) = self.shared.connection_id().await {
                if let Err(e) = self
                    .shared
                    .transport
                    .subscribe_channel(&connection_id, &channel)
                    .await
                {
                    self.shared.table.lock().await.remove_channel(local);
                    return Err(e);
                }
            }
        }

        Ok(SubscriptionHandle {
            shared: self.shared.clone(),
            target: Target::Channel(local),
        })
    }

    /// Stops the connection loop and waits for it to finish.
    pub async fn close(&self) {
        self.shared.closing.send_replace(true);

        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        let abort = task.abort_handle();
        match tokio::time::timeout(CLOSE_TIMEOUT, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Connection task ended abnormally: {}", e),
            Err(_) => {
                warn!("Connection task did not stop in time, aborting");
                abort.abort();
                self.shared.state.send_replace(ConnectionState::Closed);
            }
        }
    }
}

impl Drop for LiveQueryClient {
    fn drop(&mut self) {
        self.shared.closing.send_replace(true);
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Query(u64),
    Channel(u64),
}

/// Handle to one subscription. Dropping it keeps the subscription alive;
/// call [`cancel`](Self::cancel) to end it.
pub struct SubscriptionHandle {
    shared: Arc<Shared>,
    target: Target,
}

impl SubscriptionHandle {
    /// Current rows of a live query, in sort order. Empty for channels.
    pub async fn items(&self) -> Vec<Value> {
        match self.target {
            Target::Query(local) => self
                .shared
                .table
                .lock()
                .await
                .rows(local)
                .unwrap_or_default(),
            Target::Channel(_) => Vec::new(),
        }
    }

    pub async fn cancel(self) -> Result<()> {
        match self.target {
            Target::Query(local) => {
                let released = self.shared.table.lock().await.remove_query(local);
                match released {
                    Some(ReleasedQuery {
                        last: true,
                        server_key: Some(key),
                    }) => self.shared.transport.unsubscribe_query(&key).await,
                    _ => Ok(()),
                }
            }
            Target::Channel(local) => {
                let removed = self.shared.table.lock().await.remove_channel(local);
                let Some((channel, true)) = removed else {
                    return Ok(());
                };
                match self.shared.connection_id().await {
                    Some(connection_id) => {
                        self.shared
                            .transport
                            .unsubscribe_channel(&connection_id, &channel)
                            .await
                    }
                    None => Ok(()),
                }
            }
        }
    }
}
