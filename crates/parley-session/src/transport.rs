//! Transport contract.
//!
//! A transport moves complete logical [`Message`]s between two endpoints
//! and never interprets their fields. Chunk reassembly, framing, and
//! reconnection are transport concerns; conversation semantics live above,
//! in [`MessageConnection`](crate::MessageConnection).

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use parley_wire::Message;

use crate::Error;

/// Ingress callback installed by a connection.
///
/// Invoked once per complete inbound logical message, in delivery order.
pub type IngressHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// A bidirectional message transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Hand a message to the underlying substrate.
    ///
    /// Completes when the substrate has accepted the bytes, not when the
    /// peer has processed them.
    async fn send(&self, msg: Message) -> Result<(), Error>;

    /// Install an ingress handler.
    ///
    /// Each connection installs exactly one handler. Transports that are
    /// shared between connections deliver every inbound message to every
    /// installed handler; connections drop messages for conversations they
    /// do not own.
    async fn on_receive(&self, handler: IngressHandler);

    /// Release resources. Idempotent.
    async fn close(&self) -> Result<(), Error>;
}

/// Parse wire text into a [`Message`].
///
/// Distinguishes an unrecognized `t` tag ([`Error::UnknownMessageType`])
/// from plain malformed JSON so ingress paths can log the difference.
pub fn parse_wire_message(text: &str) -> Result<Message, Error> {
    match Message::from_wire_text(text) {
        Ok(msg) => Ok(msg),
        Err(err) => {
            if let Ok(raw) = serde_json::from_str::<serde_json::Value>(text) {
                if let Some(t) = raw.get("t").and_then(|t| t.as_str()) {
                    const KNOWN: [&str; 6] =
                        ["request", "response", "multi", "end", "error", "anomaly"];
                    if !KNOWN.contains(&t) {
                        return Err(Error::UnknownMessageType(t.to_owned()));
                    }
                }
            }
            Err(Error::Codec(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_wire_text() {
        let msg = parse_wire_message(r#"{"t":"request","c":1,"s":"A","p":"hi"}"#).unwrap();
        assert_eq!(msg.c, 1);
        assert_eq!(msg.s, "A");
    }

    #[test]
    fn unknown_type_tag_is_distinguished() {
        let err = parse_wire_message(r#"{"t":"push","c":1,"s":"A","p":null}"#).unwrap_err();
        assert!(matches!(err, Error::UnknownMessageType(t) if t == "push"));
    }

    #[test]
    fn malformed_json_is_a_codec_error() {
        let err = parse_wire_message("{not json").unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn missing_fields_are_a_codec_error() {
        let err = parse_wire_message(r#"{"t":"request"}"#).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }
}
