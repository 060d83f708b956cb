use crate::error::{LiveQueryError, Result};
use crate::message::{OutboundMessage, StreamEvent};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ConnectionId = String;

/// The physical stream towards one client. Close detection comes from the
/// transport itself through [`Transport::closed`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Resolves once the peer is gone.
    async fn closed(&self);
}

#[async_trait]
impl Transport for mpsc::Sender<Bytes> {
    async fn send(&self, frame: Bytes) -> Result<()> {
        mpsc::Sender::send(self, frame)
            .await
            .map_err(|_| LiveQueryError::Transport("stream receiver dropped".to_string()))
    }

    async fn closed(&self) {
        mpsc::Sender::closed(self).await
    }
}

/// Server-side state of one open stream
#[derive(Debug)]
struct ConnectionInfo {
    id: ConnectionId,
    backlog: mpsc::Sender<Bytes>,
    channels: Mutex<HashSet<String>>,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
}

impl ConnectionInfo {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

/// Handle returned by [`ConnectionManager::open`].
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    cancel: CancellationToken,
}

impl Connection {
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection has been torn down.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

/// Owns every open connection, its outbound backlog and its heartbeat.
#[derive(Clone)]
pub struct ConnectionManager {
    connections: Arc<DashMap<ConnectionId, Arc<ConnectionInfo>>>,
    heartbeat_interval: Duration,
    backlog_size: usize,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            heartbeat_interval: Duration::from_secs(45),
            backlog_size: 1000,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_backlog_size(mut self, size: usize) -> Self {
        self.backlog_size = size.max(1);
        self
    }

    /// Registers a new connection under a fresh identifier.
    pub fn open<T: Transport>(&self, transport: T) -> Connection {
        self.open_with_id(transport, Uuid::new_v4().to_string())
    }

    /// Registers a connection under `id`. An identifier that is currently
    /// open is never reused; a fresh one is issued instead.
    pub fn open_with_id<T: Transport>(&self, transport: T, id: ConnectionId) -> Connection {
        let id = if self.is_open(&id) {
            Uuid::new_v4().to_string()
        } else {
            id
        };

        let (backlog_tx, backlog_rx) = mpsc::channel::<Bytes>(self.backlog_size);
        let cancel = CancellationToken::new();
        let info = Arc::new(ConnectionInfo {
            id: id.clone(),
            backlog: backlog_tx,
            channels: Mutex::new(HashSet::new()),
            last_activity: Mutex::new(Instant::now()),
            cancel: cancel.clone(),
        });

        // The identity frame is always the first thing on the wire.
        if let Ok(frame) = StreamEvent::ConnectionId(id.clone()).encode() {
            let _ = info.backlog.try_send(frame);
        }

        self.connections.insert(id.clone(), info.clone());
        info!("Connection {} opened", id);

        self.spawn_writer(info, transport, backlog_rx);

        Connection { id, cancel }
    }

    fn spawn_writer<T: Transport>(
        &self,
        info: Arc<ConnectionInfo>,
        transport: T,
        mut backlog_rx: mpsc::Receiver<Bytes>,
    ) {
        let manager = self.clone();
        let period = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = info.cancel.cancelled() => break,
                    _ = transport.closed() => {
                        debug!("Transport for connection {} reported close", info.id);
                        break;
                    }
                    frame = backlog_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = transport.send(frame).await {
                            warn!("Failed to write to connection {}: {}", info.id, e);
                            break;
                        }
                    }
                    _ = heartbeat.tick() => {
                        let Ok(frame) = StreamEvent::KeepAlive.encode() else { continue };
                        if let Err(e) = transport.send(frame).await {
                            warn!("Heartbeat to connection {} failed: {}", info.id, e);
                            break;
                        }
                    }
                }
            }

            manager.detach(&info);
            debug!("Writer for connection {} stopped", info.id);
        });
    }

    /// Removes `info` if it is still the registered entry for its id.
    fn detach(&self, info: &Arc<ConnectionInfo>) {
        info.cancel.cancel();
        if self
            .connections
            .remove_if(&info.id, |_, current| Arc::ptr_eq(current, info))
            .is_some()
        {
            info!("Connection {} closed", info.id);
        }
    }

    /// Tears the connection down. Live-query subscriptions are not touched.
    pub fn close(&self, connection_id: &str) -> bool {
        match self.connections.remove(connection_id) {
            Some((_, info)) => {
                info.cancel.cancel();
                info!("Connection {} closed", connection_id);
                true
            }
            None => false,
        }
    }

    pub fn write(&self, connection_id: &str, message: &OutboundMessage) -> Result<()> {
        self.write_batch(connection_id, std::slice::from_ref(message))
    }

    /// Queues all messages as one frame so a batch is delivered entirely or not
    /// at all. Never waits on the peer.
    pub fn write_batch(&self, connection_id: &str, messages: &[OutboundMessage]) -> Result<()> {
        let info = self
            .connections
            .get(connection_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| LiveQueryError::NotFound(format!("connection {}", connection_id)))?;

        let mut buf = BytesMut::new();
        for message in messages {
            let frame = StreamEvent::Message(message.envelope()?).encode()?;
            buf.extend_from_slice(&frame);
        }

        match info.backlog.try_send(buf.freeze()) {
            Ok(()) => {
                info.touch();
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Backlog full for connection {}, dropping connection",
                    connection_id
                );
                self.detach(&info);
                Err(LiveQueryError::Transport(format!(
                    "backlog full for connection {}",
                    connection_id
                )))
            }
            Err(TrySendError::Closed(_)) => {
                self.detach(&info);
                Err(LiveQueryError::Transport(format!(
                    "connection {} closed",
                    connection_id
                )))
            }
        }
    }

    pub fn is_open(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn touch(&self, connection_id: &str) -> bool {
        match self.connections.get(connection_id) {
            Some(info) => {
                info.touch();
                true
            }
            None => false,
        }
    }

    pub fn idle_for(&self, connection_id: &str) -> Option<Duration> {
        self.connections
            .get(connection_id)
            .map(|info| info.last_activity.lock().elapsed())
    }

    pub fn add_channel(&self, connection_id: &str, channel: &str) -> bool {
        match self.connections.get(connection_id) {
            Some(info) => {
                info.channels.lock().insert(channel.to_string());
                true
            }
            None => false,
        }
    }

    pub fn remove_channel(&self, connection_id: &str, channel: &str) -> bool {
        match self.connections.get(connection_id) {
            Some(info) => {
                info.channels.lock().remove(channel);
                true
            }
            None => false,
        }
    }

    pub fn channels(&self, connection_id: &str) -> Option<HashSet<String>> {
        self.connections
            .get(connection_id)
            .map(|info| info.channels.lock().clone())
    }

    pub fn subscribers_of(&self, channel: &str) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|entry| entry.channels.lock().contains(channel))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
