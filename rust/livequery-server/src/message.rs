//! Outbound message types and their Server-Sent-Events framing.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_CONNECTION_ID: &str = "connectionId";
pub const EVENT_KEEP_ALIVE: &str = "keep-alive";
pub const EVENT_MESSAGE: &str = "message";

/// Delta for one live query, serialized as `{"type": .., "data": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum LiveQueryMessage {
    /// Full snapshot, sent on first subscribe
    All(Vec<Value>),
    Add(Value),
    Replace {
        #[serde(rename = "oldId")]
        old_id: String,
        item: Value,
    },
    Remove { id: String },
}

impl LiveQueryMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            LiveQueryMessage::All(_) => "all",
            LiveQueryMessage::Add(_) => "add",
            LiveQueryMessage::Replace { .. } => "replace",
            LiveQueryMessage::Remove { .. } => "remove",
        }
    }
}

/// Anything the engine pushes down a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    LiveQuery {
        subscription: String,
        message: LiveQueryMessage,
    },
    Channel {
        channel: String,
        payload: Value,
    },
}

impl OutboundMessage {
    pub fn live(subscription: impl Into<String>, message: LiveQueryMessage) -> Self {
        OutboundMessage::LiveQuery {
            subscription: subscription.into(),
            message,
        }
    }

    pub fn channel(channel: impl Into<String>, payload: Value) -> Self {
        OutboundMessage::Channel {
            channel: channel.into(),
            payload,
        }
    }

    /// Live-query traffic uses the subscription key as its channel.
    pub fn envelope(&self) -> Result<Envelope, serde_json::Error> {
        Ok(match self {
            OutboundMessage::LiveQuery {
                subscription,
                message,
            } => Envelope {
                channel: subscription.clone(),
                data: serde_json::to_value(message)?,
            },
            OutboundMessage::Channel { channel, payload } => Envelope {
                channel: channel.clone(),
                data: payload.clone(),
            },
        })
    }
}

/// JSON payload of a `message` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub data: Value,
}

/// One event on the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    ConnectionId(String),
    KeepAlive,
    Message(Envelope),
}

impl StreamEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::ConnectionId(_) => EVENT_CONNECTION_ID,
            StreamEvent::KeepAlive => EVENT_KEEP_ALIVE,
            StreamEvent::Message(_) => EVENT_MESSAGE,
        }
    }

    /// Encodes as `event:<type>\ndata:<payload>\n\n`.
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        let data = match self {
            StreamEvent::ConnectionId(id) => id.clone(),
            StreamEvent::KeepAlive => String::new(),
            StreamEvent::Message(envelope) => serde_json::to_string(envelope)?,
        };
        Ok(Bytes::from(format!(
            "event:{}\ndata:{}\n\n",
            self.event_type(),
            data
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_live_query_message_wire_format() {
        let replace = LiveQueryMessage::Replace {
            old_id: "7".to_string(),
            item: json!({"id": "7", "title": "x"}),
        };
        let json = serde_json::to_value(&replace).unwrap();
        assert_eq!(json["type"], "replace");
        assert_eq!(json["data"]["oldId"], "7");
        assert_eq!(json["data"]["item"]["title"], "x");

        let remove = serde_json::to_value(LiveQueryMessage::Remove { id: "3".into() }).unwrap();
        assert_eq!(remove, json!({"type": "remove", "data": {"id": "3"}}));

        let all = serde_json::to_value(LiveQueryMessage::All(vec![json!({"id": "1"})])).unwrap();
        assert_eq!(all, json!({"type": "all", "data": [{"id": "1"}]}));
    }

    #[test]
    fn test_envelope_for_live_query_uses_subscription_key() {
        let msg = OutboundMessage::live("client:abc", LiveQueryMessage::Add(json!({"id": "1"})));
        let envelope = msg.envelope().unwrap();
        assert_eq!(envelope.channel, "client:abc");
        assert_eq!(envelope.data["type"], "add");
    }

    #[test]
    fn test_sse_encoding() {
        let id = StreamEvent::ConnectionId("abc".into()).encode().unwrap();
        assert_eq!(&id[..], b"event:connectionId\ndata:abc\n\n");

        let ka = StreamEvent::KeepAlive.encode().unwrap();
        assert_eq!(&ka[..], b"event:keep-alive\ndata:\n\n");

        let msg = StreamEvent::Message(Envelope {
            channel: "alerts".into(),
            data: json!("hi"),
        })
        .encode()
        .unwrap();
        assert_eq!(
            &msg[..],
            b"event:message\ndata:{\"channel\":\"alerts\",\"data\":\"hi\"}\n\n"
        );
    }
}
