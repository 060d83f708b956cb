//! Named-channel publish/subscribe.
//!
//! Subscription authorization is decided once, at subscribe time; a channel
//! membership stored on a connection is therefore always an allowed one.

use crate::auth::{allow_all, AuthContext, Authorizer, Principal};
use crate::connection::ConnectionManager;
use crate::message::OutboundMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelSubscribeOutcome {
    Ok,
    Forbidden,
    ConnectionNotFound,
}

#[derive(Clone)]
pub struct ChannelPublisher {
    connections: ConnectionManager,
    authorizer: Arc<dyn Authorizer>,
}

impl ChannelPublisher {
    pub fn new(connections: ConnectionManager) -> Self {
        Self {
            connections,
            authorizer: allow_all(),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn user_can_subscribe(&self, channel: &str, principal: &Principal) -> bool {
        self.authorizer
            .allowed(principal, &AuthContext::Channel(channel))
    }

    pub fn subscribe_to_channel(
        &self,
        client_id: &str,
        channel: &str,
        principal: &Principal,
    ) -> ChannelSubscribeOutcome {
        self.update_membership(client_id, channel, principal, false)
    }

    pub fn unsubscribe_from_channel(
        &self,
        client_id: &str,
        channel: &str,
        principal: &Principal,
    ) -> ChannelSubscribeOutcome {
        self.update_membership(client_id, channel, principal, true)
    }

    fn update_membership(
        &self,
        client_id: &str,
        channel: &str,
        principal: &Principal,
        remove: bool,
    ) -> ChannelSubscribeOutcome {
        if !self.connections.is_open(client_id) {
            return ChannelSubscribeOutcome::ConnectionNotFound;
        }
        if !self.user_can_subscribe(channel, principal) {
            debug!("Client {} denied channel {}", client_id, channel);
            return ChannelSubscribeOutcome::Forbidden;
        }

        let applied = if remove {
            self.connections.remove_channel(client_id, channel)
        } else {
            self.connections.add_channel(client_id, channel)
        };

        if !applied {
            // closed between the check and the update
            return ChannelSubscribeOutcome::ConnectionNotFound;
        }

        debug!(
            "Client {} {} channel {}",
            client_id,
            if remove { "left" } else { "joined" },
            channel
        );
        ChannelSubscribeOutcome::Ok
    }

    /// Delivers `payload` to every connection subscribed to `channel` and
    /// returns how many accepted it.
    pub fn send(&self, channel: &str, payload: Value, principal: &Principal) -> usize {
        let message = OutboundMessage::channel(channel, payload);
        let mut delivered = 0;

        for connection_id in self.connections.subscribers_of(channel) {
            match self.connections.write(&connection_id, &message) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    "Channel {} message not delivered to {}: {}",
                    channel, connection_id, e
                ),
            }
        }

        debug!(
            "Published to channel {} by {:?}: {} recipient(s)",
            channel, principal.id, delivered
        );
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::FnAuthorizer;
    use crate::connection::tests::next_frame;
    use bytes::Bytes;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn open(manager: &ConnectionManager) -> (String, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = manager.open(tx);
        (conn.id, rx)
    }

    #[tokio::test]
    async fn test_publish_reaches_only_channel_subscribers() {
        let manager = ConnectionManager::new();
        let publisher = ChannelPublisher::new(manager.clone());
        let anyone = Principal::anonymous();

        let (a, mut rx_a) = open(&manager);
        let (b, mut rx_b) = open(&manager);
        let (c, mut rx_c) = open(&manager);
        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            next_frame(rx).await.unwrap();
        }

        assert_eq!(publisher.subscribe_to_channel(&a, "alerts", &anyone), ChannelSubscribeOutcome::Ok);
        assert_eq!(publisher.subscribe_to_channel(&b, "alerts", &anyone), ChannelSubscribeOutcome::Ok);
        assert_eq!(publisher.subscribe_to_channel(&c, "news", &anyone), ChannelSubscribeOutcome::Ok);

        assert_eq!(publisher.send("alerts", json!({"level": "high"}), &anyone), 2);

        let expected = "event:message\ndata:{\"channel\":\"alerts\",\"data\":{\"level\":\"high\"}}\n\n";
        assert_eq!(next_frame(&mut rx_a).await.unwrap(), expected);
        assert_eq!(next_frame(&mut rx_b).await.unwrap(), expected);
        let nothing = tokio::time::timeout(Duration::from_millis(100), rx_c.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_forbidden_subscription_is_not_created() {
        let manager = ConnectionManager::new();
        let publisher = ChannelPublisher::new(manager.clone()).with_authorizer(Arc::new(
            FnAuthorizer::new(|p: &Principal, _ctx: &AuthContext<'_>| p.has_role("admin")),
        ));
        let guest = Principal::user("guest");

        let (id, mut rx) = open(&manager);
        next_frame(&mut rx).await.unwrap();

        assert_eq!(
            publisher.subscribe_to_channel(&id, "alerts", &guest),
            ChannelSubscribeOutcome::Forbidden
        );
        assert!(manager.channels(&id).unwrap().is_empty());

        assert_eq!(publisher.send("alerts", json!("x"), &guest), 0);
        let nothing = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_unknown_connection() {
        let publisher = ChannelPublisher::new(ConnectionManager::new());
        assert_eq!(
            publisher.subscribe_to_channel("ghost", "alerts", &Principal::anonymous()),
            ChannelSubscribeOutcome::ConnectionNotFound
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let manager = ConnectionManager::new();
        let publisher = ChannelPublisher::new(manager.clone());
        let anyone = Principal::anonymous();
        let (id, mut rx) = open(&manager);
        next_frame(&mut rx).await.unwrap();

        publisher.subscribe_to_channel(&id, "alerts", &anyone);
        assert_eq!(
            publisher.unsubscribe_from_channel(&id, "alerts", &anyone),
            ChannelSubscribeOutcome::Ok
        );
        assert_eq!(publisher.send("alerts", json!(1), &anyone), 0);
    }
}
