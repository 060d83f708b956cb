//! Wire types of the event stream and an incremental SSE decoder.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum LiveQueryMessage {
    All(Vec<Value>),
    Add(Value),
    Replace {
        #[serde(rename = "oldId")]
        old_id: String,
        item: Value,
    },
    Remove { id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    ConnectionId(String),
    KeepAlive,
    Message(Envelope),
}

/// Largest incomplete event the decoder holds before giving up
pub const DEFAULT_MAX_PENDING: usize = 16 * 1024 * 1024;

/// Splits a byte stream into events. Chunks may cut anywhere, including in
/// the middle of a UTF-8 sequence.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Offset up to which `buffer` holds no terminator
    scanned: usize,
    max_pending: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_pending(mut self, bytes: usize) -> Self {
        self.max_pending = bytes;
        self
    }

    /// Feeds one chunk and returns the events it completed. Fails once an
    /// unterminated event grows past the pending limit; the decoder is reset.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>> {
        self.buffer
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        let mut start = 0;
        let mut scan = self.scanned;
        while let Some(offset) = self.buffer[scan..].windows(2).position(|w| w == b"\n\n") {
            let end = scan + offset;
            if let Some(event) = parse_block(&self.buffer[start..end]) {
                events.push(event);
            }
            start = end + 2;
            scan = start;
        }
        self.buffer.drain(..start);
        // the last byte may open a terminator completed by the next chunk
        self.scanned = self.buffer.len().saturating_sub(1);

        if self.buffer.len() > self.max_pending {
            let size = self.buffer.len();
            self.buffer.clear();
            self.scanned = 0;
            return Err(ClientError::Stream(format!(
                "event exceeds {} bytes ({} pending)",
                self.max_pending, size
            )));
        }
        Ok(events)
    }

    /// Bytes of an incomplete event still waiting for its terminator
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn parse_block(block: &[u8]) -> Option<StreamEvent> {
    let text = String::from_utf8_lossy(block);
    let mut event_type = "message".to_string();
    let mut data: Vec<&str> = Vec::new();
    let mut seen_field = false;

    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        seen_field = true;
        match field {
            "event" => event_type = value.to_string(),
            "data" => data.push(value),
            _ => {}
        }
    }

    if !seen_field {
        return None;
    }

    let data = data.join("\n");
    match event_type.as_str() {
        "connectionId" => Some(StreamEvent::ConnectionId(data)),
        "keep-alive" => Some(StreamEvent::KeepAlive),
        "message" => match serde_json::from_str::<Envelope>(&data) {
            Ok(envelope) => Some(StreamEvent::Message(envelope)),
            Err(e) => {
                warn!("Dropping malformed message event: {}", e);
                None
            }
        },
        other => {
            debug!("Ignoring unknown event type {}", other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const STREAM: &str = "event:connectionId\ndata:abc\n\n\
                          event:keep-alive\ndata:\n\n\
                          event:message\ndata:{\"channel\":\"alerts\",\"data\":{\"n\":\"\u{e9}\"}}\n\n";

    #[test]
    fn test_decode_whole_stream() {
        let events = SseDecoder::new().push(STREAM.as_bytes()).unwrap();
        assert_eq!(
            events,
            vec![
                StreamEvent::ConnectionId("abc".to_string()),
                StreamEvent::KeepAlive,
                StreamEvent::Message(Envelope {
                    channel: "alerts".to_string(),
                    data: json!({"n": "\u{e9}"}),
                }),
            ]
        );
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        for byte in STREAM.as_bytes() {
            events.extend(decoder.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(events.len(), 3);
        assert_eq!(decoder.pending(), 0);
        match &events[2] {
            StreamEvent::Message(envelope) => assert_eq!(envelope.data["n"], "\u{e9}"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_crlf_comments_and_garbage() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": hello\r\n\r\nevent: keep-alive\r\ndata:\r\n\r\nevent:message\ndata:not json\n\nevent:other\ndata:x\n\n").unwrap();
        assert_eq!(events, vec![StreamEvent::KeepAlive]);
    }

    #[test]
    fn test_unterminated_event_is_capped() {
        let mut decoder = SseDecoder::new().with_max_pending(64);
        let events = decoder.push(b"event:keep-alive\ndata:\n\nevent:message\ndata:").unwrap();
        assert_eq!(events, vec![StreamEvent::KeepAlive]);
        for _ in 0..3 {
            assert!(decoder.push(&[b'x'; 10]).unwrap().is_empty());
        }
        assert!(matches!(decoder.push(&[b'x'; 40]), Err(ClientError::Stream(_))));
        assert_eq!(decoder.pending(), 0);

        let events = decoder.push(b"event:keep-alive\n").unwrap();
        assert!(events.is_empty());
        assert_eq!(decoder.push(b"\n").unwrap(), vec![StreamEvent::KeepAlive]);
    }

    #[test]
    fn test_live_query_message_wire_format() {
        let parsed: LiveQueryMessage =
            serde_json::from_value(json!({"type": "replace", "data": {"oldId": "1", "item": {"id": "1"}}}))
                .unwrap();
        assert_eq!(
            parsed,
            LiveQueryMessage::Replace {
                old_id: "1".to_string(),
                item: json!({"id": "1"})
            }
        );
        let all: LiveQueryMessage = serde_json::from_value(json!({"type": "all", "data": []})).unwrap();
        assert_eq!(all, LiveQueryMessage::All(vec![]));
    }
}
