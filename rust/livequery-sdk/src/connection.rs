use crate::config::ClientConfig;
use crate::error::Result;
use crate::frame::{Envelope, StreamEvent};
use crate::query::Query;
use crate::subscription::{Delivery, SubscriptionTable};
use crate::transport::{EventStream, StreamTransport};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Opening,
    Open,
    Reconnecting { attempt: u32 },
    /// Closed on request
    Closed,
    /// Gave up reconnecting
    Failed,
}

/// State shared between the client handle and the connection loop
pub(crate) struct Shared {
    pub transport: Arc<dyn StreamTransport>,
    pub table: Mutex<SubscriptionTable>,
    pub connection_id: RwLock<Option<String>>,
    pub state: watch::Sender<ConnectionState>,
    pub closing: watch::Sender<bool>,
}

impl Shared {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Opening);
        let (closing, _) = watch::channel(false);
        Self {
            transport,
            table: Mutex::new(SubscriptionTable::new()),
            connection_id: RwLock::new(None),
            state,
            closing,
        }
    }

    pub async fn connection_id(&self) -> Option<String> {
        self.connection_id.read().await.clone()
    }

    /// Issues one query on the current connection and binds the returned key.
    pub async fn subscribe_query(&self, connection_id: &str, group: u64, query: &Query) -> Result<()> {
        let key = self.transport.subscribe_query(connection_id, query).await?;

        let deliveries = {
            let mut table = self.table.lock().await;
            if table.contains_query(group) {
                Some(table.bind_key(group, key.clone()))
            } else {
                None
            }
        };

        match deliveries {
            Some(deliveries) => deliveries.into_iter().for_each(Delivery::deliver),
            // cancelled while the call was in flight
            None => {
                if let Err(e) = self.transport.unsubscribe_query(&key).await {
                    debug!("Failed to drop orphaned subscription {}: {}", key, e);
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&self, envelope: Envelope, connection_id: &str) {
        let deliveries = self.table.lock().await.dispatch(envelope, connection_id);
        deliveries.into_iter().for_each(Delivery::deliver);
    }
}

enum StreamEnd {
    Closed,
    Lost,
}

pub(crate) fn spawn_connection_loop(shared: Arc<Shared>, config: ClientConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut closing = shared.closing.subscribe();
        let mut attempt: u32 = 0;
        let mut previous_id: Option<String> = None;

        loop {
            if *closing.borrow() {
                break;
            }

            let resume_id = previous_id.as_deref().filter(|_| config.resume);
            let established = tokio::select! {
                result = establish(&shared, resume_id) => result,
                _ = closing.changed() => break,
            };
            match established {
                Ok((connection_id, events)) => {
                    attempt = 0;
                    previous_id = Some(connection_id.clone());

                    resubscribe_all(&shared, &connection_id).await;
                    shared.state.send_replace(ConnectionState::Open);
                    info!("Connected as {}", connection_id);

                    let end = run_stream(&shared, &config, &connection_id, events, &mut closing).await;
                    *shared.connection_id.write().await = None;

                    if let StreamEnd::Closed = end {
                        break;
                    }
                    warn!("Stream for connection {} lost", connection_id);
                }
                Err(e) => {
                    error!("Connection failed: {}", e);
                }
            }

            if *closing.borrow() {
                break;
            }

            if !config.auto_reconnect || attempt >= config.max_reconnect_attempts {
                error!("Giving up after {} reconnect attempt(s)", attempt);
                shared.state.send_replace(ConnectionState::Failed);
                return;
            }

            let delay = config.reconnect_delay(attempt);
            attempt += 1;
            shared
                .state
                .send_replace(ConnectionState::Reconnecting { attempt });
            info!("Reconnecting in {:?} (attempt {})", delay, attempt);

            tokio::select! {
                _ = sleep(delay) => {}
                _ = closing.changed() => break,
            }
        }

        *shared.connection_id.write().await = None;
        shared.state.send_replace(ConnectionState::Closed);
        debug!("Connection loop stopped");
    })
}

/// Opens the stream and waits for the server to announce our identifier.
async fn establish(shared: &Shared, resume_id: Option<&str>) -> Result<(String, EventStream)> {
    let mut events = shared.transport.open(resume_id).await?;

    loop {
        match events.next().await {
            Some(Ok(StreamEvent::ConnectionId(id))) => {
                *shared.connection_id.write().await = Some(id.clone());
                return Ok((id, events));
            }
            Some(Ok(other)) => debug!("Ignoring {:?} before connection id", other),
            Some(Err(e)) => return Err(e),
            None => return Err(crate::error::ClientError::ConnectionClosed),
        }
    }
}

async fn resubscribe_all(shared: &Shared, connection_id: &str) {
    let (queries, channels) = {
        let mut table = shared.table.lock().await;
        table.reset_keys();
        (table.queries(), table.channel_names())
    };

    for channel in &channels {
        if let Err(e) = shared.transport.subscribe_channel(connection_id, channel).await {
            warn!("Resubscribe to channel {} failed: {}", channel, e);
        }
    }
    for (group, query) in &queries {
        if let Err(e) = shared.subscribe_query(connection_id, *group, query).await {
            warn!("Resubscribe to {} query failed: {}", query.entity_key, e);
        }
    }

    if !queries.is_empty() || !channels.is_empty() {
        info!(
            "Reissued {} query and {} channel subscription(s)",
            queries.len(),
            channels.len()
        );
    }
}

async fn run_stream(
    shared: &Shared,
    config: &ClientConfig,
    connection_id: &str,
    mut events: EventStream,
    closing: &mut watch::Receiver<bool>,
) -> StreamEnd {
    let period = config.keep_alive_interval;
    let mut reconcile_timer = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = closing.changed() => return StreamEnd::Closed,
            event = events.next() => match event {
                Some(Ok(StreamEvent::Message(envelope))) => shared.dispatch(envelope, connection_id).await,
                Some(Ok(StreamEvent::KeepAlive)) => debug!("Keep-alive on {}", connection_id),
                Some(Ok(StreamEvent::ConnectionId(id))) => debug!("Unexpected connection id {}", id),
                Some(Err(e)) => {
                    warn!("Stream error: {}", e);
                    return StreamEnd::Lost;
                }
                None => return StreamEnd::Lost,
            },
            _ = reconcile_timer.tick() => {
                if !reconcile(shared, connection_id).await {
                    return StreamEnd::Lost;
                }
            }
        }
    }
}

/// Asks the server which of our ids it forgot. Forgotten queries are
/// reissued; a forgotten connection forces a reconnect.
async fn reconcile(shared: &Shared, connection_id: &str) -> bool {
    let mut ids = vec![connection_id.to_string()];
    ids.extend(shared.table.lock().await.server_keys());

    let unknown = match shared.transport.keep_alive(&ids).await {
        Ok(unknown) => unknown,
        Err(e) => {
            warn!("Keep-alive failed: {}", e);
            return true;
        }
    };

    if unknown.iter().any(|id| id == connection_id) {
        warn!("Server no longer knows connection {}", connection_id);
        return false;
    }

    for key in unknown {
        let forgotten = shared.table.lock().await.unbind_key(&key);
        if let Some((group, query)) = forgotten {
            info!("Subscription {} was forgotten by the server, resubscribing", key);
            if let Err(e) = shared.subscribe_query(connection_id, group, &query).await {
                warn!("Resubscribe of {} failed: {}", key, e);
            }
        }
    }
    true
}
