//! The single wire record and its payload shapes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::Value;

/// Payload carried by every `end` message.
pub const END_PAYLOAD: &str = "END";

/// Message type tag, `t` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// A request from one agent to the other.
    Request,
    /// Single terminal reply.
    Response,
    /// One of many streamed replies; more may follow.
    Multi,
    /// Terminator for a `multi` stream; payload is always [`END_PAYLOAD`].
    End,
    /// Unexpected failure from the responder.
    Error,
    /// Expected, structured failure from the responder.
    Anomaly,
}

impl MessageType {
    /// Whether this type terminates a conversation on the requester side.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageType::Response | MessageType::End | MessageType::Error | MessageType::Anomaly
        )
    }

    /// The wire literal for this type.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Multi => "multi",
            MessageType::End => "end",
            MessageType::Error => "error",
            MessageType::Anomaly => "anomaly",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire record.
///
/// Field keys are single letters to minimize wire bytes:
/// `t` type, `c` conversation number, `s` source id, `p` payload,
/// `z` optional signature (`"<nonce>:<hash>"`, present iff signing is
/// enabled).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub t: MessageType,
    pub c: u64,
    pub s: String,
    pub p: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<String>,
}

impl Message {
    pub fn new(t: MessageType, c: u64, s: impl Into<String>, p: Value) -> Self {
        Self {
            t,
            c,
            s: s.into(),
            p,
            z: None,
        }
    }

    pub fn request(c: u64, s: impl Into<String>, p: Value) -> Self {
        Self::new(MessageType::Request, c, s, p)
    }

    pub fn response(c: u64, s: impl Into<String>, p: Value) -> Self {
        Self::new(MessageType::Response, c, s, p)
    }

    pub fn multi(c: u64, s: impl Into<String>, p: Value) -> Self {
        Self::new(MessageType::Multi, c, s, p)
    }

    pub fn end(c: u64, s: impl Into<String>) -> Self {
        Self::new(MessageType::End, c, s, Value::from(END_PAYLOAD))
    }

    pub fn error(c: u64, s: impl Into<String>, payload: &ErrorPayload) -> Self {
        Self::new(MessageType::Error, c, s, payload.to_value())
    }

    pub fn anomaly(c: u64, s: impl Into<String>, payload: &AnomalyPayload) -> Self {
        Self::new(MessageType::Anomaly, c, s, payload.to_value())
    }

    /// Serialize to the JSON wire text.
    pub fn to_wire_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from the JSON wire text.
    pub fn from_wire_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} from {}", self.t, self.c, self.s)
    }
}

/// Payload of an `error` message.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPayload {
    pub message: String,
    pub request_payload: Value,
}

impl ErrorPayload {
    pub fn to_value(&self) -> Value {
        let mut map = std::collections::BTreeMap::new();
        map.insert("message".to_string(), Value::from(self.message.clone()));
        map.insert("requestPayload".to_string(), self.request_payload.clone());
        Value::Object(map)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        Some(Self {
            message: value.get("message")?.as_str()?.to_owned(),
            request_payload: value.get("requestPayload").cloned().unwrap_or_default(),
        })
    }
}

/// Payload of an `anomaly` message.
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyPayload {
    pub message: String,
    pub info: Value,
    pub request_payload: Value,
}

impl AnomalyPayload {
    pub fn to_value(&self) -> Value {
        let mut map = std::collections::BTreeMap::new();
        map.insert("message".to_string(), Value::from(self.message.clone()));
        map.insert("info".to_string(), self.info.clone());
        map.insert("requestPayload".to_string(), self.request_payload.clone());
        Value::Object(map)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        Some(Self {
            message: value.get("message")?.as_str()?.to_owned(),
            info: value.get("info").cloned().unwrap_or_default(),
            request_payload: value.get("requestPayload").cloned().unwrap_or_default(),
        })
    }
}

/// Generates unique conversation numbers.
///
/// Monotonically increasing counter starting at 1. Conversation numbers must
/// never be reused within a process, so normal use goes through the
/// process-wide [`next_conversation_id`]; connections sharing a transport
/// rely on this to route without coordination.
pub struct ConversationIdGenerator {
    next: AtomicU64,
}

impl ConversationIdGenerator {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ConversationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

static CONVERSATION_IDS: ConversationIdGenerator = ConversationIdGenerator::new();

/// Draw the next conversation number from the process-wide generator.
pub fn next_conversation_id() -> u64 {
    CONVERSATION_IDS.next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_keys_are_short() {
        let msg = Message::request(1, "A", Value::from("hello"));
        let text = msg.to_wire_text().unwrap();
        assert_eq!(text, r#"{"t":"request","c":1,"s":"A","p":"hello"}"#);
    }

    #[test]
    fn signature_field_round_trips_when_present() {
        let mut msg = Message::response(2, "B", Value::from("ok"));
        msg.z = Some("aa:bb".to_string());
        let text = msg.to_wire_text().unwrap();
        assert!(text.contains(r#""z":"aa:bb""#));
        let back = Message::from_wire_text(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn end_carries_the_literal() {
        let msg = Message::end(3, "B");
        assert_eq!(msg.p.as_str(), Some(END_PAYLOAD));
    }

    #[test]
    fn type_literals_match_the_wire() {
        for (t, literal) in [
            (MessageType::Request, "\"request\""),
            (MessageType::Response, "\"response\""),
            (MessageType::Multi, "\"multi\""),
            (MessageType::End, "\"end\""),
            (MessageType::Error, "\"error\""),
            (MessageType::Anomaly, "\"anomaly\""),
        ] {
            assert_eq!(serde_json::to_string(&t).unwrap(), literal);
        }
    }

    #[test]
    fn terminal_classification() {
        assert!(!MessageType::Request.is_terminal());
        assert!(!MessageType::Multi.is_terminal());
        assert!(MessageType::Response.is_terminal());
        assert!(MessageType::End.is_terminal());
        assert!(MessageType::Error.is_terminal());
        assert!(MessageType::Anomaly.is_terminal());
    }

    #[test]
    fn conversation_ids_are_strictly_increasing() {
        let ids: Vec<u64> = (0..100).map(|_| next_conversation_id()).collect();
        for pair in ids.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn error_payload_round_trip() {
        let payload = ErrorPayload {
            message: "boom".into(),
            request_payload: Value::from("req"),
        };
        let back = ErrorPayload::from_value(&payload.to_value()).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn anomaly_payload_round_trip() {
        let mut info = std::collections::BTreeMap::new();
        info.insert("code".to_string(), Value::from(7i64));
        let payload = AnomalyPayload {
            message: "nope".into(),
            info: Value::Object(info),
            request_payload: Value::from("req"),
        };
        let back = AnomalyPayload::from_value(&payload.to_value()).unwrap();
        assert_eq!(back, payload);
    }
}
