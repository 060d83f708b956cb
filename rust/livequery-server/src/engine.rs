use crate::auth::{Authorizer, Principal};
use crate::channel::ChannelPublisher;
use crate::config::StreamConfig;
use crate::connection::{Connection, ConnectionManager, Transport};
use crate::registry::SubscriptionRegistry;
use crate::storage::SubscriptionStorage;
use crate::store::{DataStore, EntityCatalog};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The assembled engine: connections, channels and live queries sharing one
/// connection manager.
#[derive(Clone)]
pub struct LiveQueryEngine {
    connections: ConnectionManager,
    channels: ChannelPublisher,
    registry: Arc<SubscriptionRegistry>,
}

impl LiveQueryEngine {
    pub fn new(
        store: Arc<dyn DataStore>,
        catalog: Arc<EntityCatalog>,
        storage: Arc<dyn SubscriptionStorage>,
        channel_authorizer: Arc<dyn Authorizer>,
        config: &StreamConfig,
    ) -> Self {
        let connections = ConnectionManager::new()
            .with_heartbeat_interval(config.heartbeat_interval)
            .with_backlog_size(config.backlog_size);
        let channels = ChannelPublisher::new(connections.clone()).with_authorizer(channel_authorizer);
        let registry = Arc::new(SubscriptionRegistry::new(
            store,
            catalog,
            connections.clone(),
            channels.clone(),
            storage,
        ));

        Self {
            connections,
            channels,
            registry,
        }
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn channels(&self) -> &ChannelPublisher {
        &self.channels
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Opens a stream. A previous identifier is honored only when it is not
    /// currently open and still owns live-query subscriptions; those are then
    /// recomputed so the client receives what it missed.
    pub fn open_stream<T: Transport>(&self, transport: T, requested_id: Option<&str>) -> Connection {
        let resumable = requested_id
            .filter(|id| !self.connections.is_open(id) && self.registry.has_client(id))
            .map(str::to_string);

        match resumable {
            Some(id) => {
                let connection = self.connections.open_with_id(transport, id);
                self.registry.resume(&connection.id);
                connection
            }
            None => {
                if let Some(id) = requested_id {
                    debug!("Not resuming connection {}, issuing a fresh id", id);
                }
                self.connections.open(transport)
            }
        }
    }

    pub fn publish(&self, channel: &str, payload: Value, principal: &Principal) -> usize {
        self.channels.send(channel, payload, principal)
    }

    /// Periodically drops live-query subscriptions of clients that stayed
    /// away longer than `ttl`.
    pub fn spawn_sweeper(
        &self,
        ttl: Duration,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.registry.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        match registry.purge_expired(ttl).await {
                            Ok(0) => {}
                            Ok(n) => info!("Expired {} idle subscription(s)", n),
                            Err(e) => warn!("Subscription sweep failed: {}", e),
                        }
                    }
                }
            }
            debug!("Subscription sweeper stopped");
        })
    }
}
