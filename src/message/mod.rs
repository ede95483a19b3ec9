//! Message value type carried through every queue.
//!
//! A message is immutable once it has been handed to a queue. The option map
//! is filled exactly once, from the caller-supplied `MESSAGE_*` metadata, while
//! the message is being built.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content type assumed when a producer does not send one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A queued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// MIME type supplied by the producer
    pub content_type: String,
    /// When the broker accepted the message
    pub created_at: DateTime<Utc>,
    /// Producer metadata, echoed back to consumers as `MESSAGE_<NAME>` headers
    pub options: BTreeMap<String, String>,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn new(payload: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            content_type: content_type.into(),
            created_at: Utc::now(),
            options: BTreeMap::new(),
        }
    }

    /// Attach one metadata option.
    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    /// Attach every option from an iterator of name/value pairs.
    pub fn with_options<I, K, V>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.options
            .extend(options.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Payload length in bytes.
    pub fn bytes(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Everything about a message except its payload.
///
/// This is what storage backends serialize next to the raw payload bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    pub bytes: u64,
}

impl MessageHeader {
    pub fn of(message: &Message) -> Self {
        Self {
            content_type: message.content_type.clone(),
            created_at: message.created_at,
            options: message.options.clone(),
            bytes: message.bytes(),
        }
    }

    /// Rebuild the full message around a payload.
    pub fn into_message(self, payload: Vec<u8>) -> Message {
        Message {
            payload,
            content_type: self.content_type,
            created_at: self.created_at,
            options: self.options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_new() {
        let msg = Message::new("hello", "text/plain");

        assert_eq!(msg.payload, b"hello");
        assert_eq!(msg.content_type, "text/plain");
        assert_eq!(msg.bytes(), 5);
        assert!(msg.options.is_empty());
    }

    #[test]
    fn test_message_options_are_ordered() {
        let msg = Message::new(Vec::new(), DEFAULT_CONTENT_TYPE)
            .with_option("zeta", "1")
            .with_options([("alpha", "2"), ("mid", "3")]);

        let names: Vec<_> = msg.options.keys().cloned().collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        assert_eq!(msg.bytes(), 0);
    }

    #[test]
    fn test_header_round_trip_keeps_metadata() {
        let msg = Message::new("payload", "application/json").with_option("trace", "abc");

        let json = serde_json::to_string(&MessageHeader::of(&msg)).unwrap();
        let header: MessageHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(header.bytes, 7);

        let rebuilt = header.into_message(msg.payload.clone());
        assert_eq!(rebuilt, msg);
    }
}
