//! Error taxonomy for the conversation layer.
//!
//! The taxonomy splits along one line the application must care about:
//! [`Anomaly`] is an expected, structured failure that travels the wire with
//! its `info` intact, while everything else is an unexpected error. Ingress
//! failures (bad signature, unknown type, unroutable conversation) are
//! logged and the offending message dropped; egress failures propagate to
//! the caller.

use std::time::Duration;

use thiserror::Error;

use parley_wire::{SignatureError, Value};

/// An expected, semantic failure.
///
/// Anomalies thrown by a receive handler are serialized as `anomaly`
/// messages and rethrown at the requester with `info` preserved. They are
/// part of an application's normal control flow, not bugs.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct Anomaly {
    pub message: String,
    pub info: Value,
}

impl Anomaly {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            info: Value::Null,
        }
    }

    pub fn with_info(message: impl Into<String>, info: Value) -> Self {
        Self {
            message: message.into(),
            info,
        }
    }
}

/// Errors raised by connections and transports.
#[derive(Debug, Error)]
pub enum Error {
    /// Expected failure relayed from the responder.
    #[error(transparent)]
    Anomaly(#[from] Anomaly),

    /// Unexpected failure relayed from the responder.
    #[error("error from peer: {message}")]
    Remote { message: String },

    /// Inbound message failed signature verification.
    #[error(transparent)]
    Verification(#[from] SignatureError),

    /// A response queue read exceeded the configured deadline.
    #[error("conversation {c} timed out after {timeout:?}")]
    Timeout { c: u64, timeout: Duration },

    /// The transport could not reach its peer.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The socket closed while an operation was pending.
    #[error("socket closed: {0}")]
    SocketClosed(String),

    /// A request arrived but no receive handler is installed.
    #[error("request received but no receive handler is installed")]
    NoHandler,

    /// Inbound message carried an unrecognized type tag.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Substrate-level send/receive failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Wire text could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error is an [`Anomaly`].
    pub fn is_anomaly(&self) -> bool {
        matches!(self, Error::Anomaly(_))
    }

    /// Borrow the anomaly, if that is what this error is.
    pub fn as_anomaly(&self) -> Option<&Anomaly> {
        match self {
            Error::Anomaly(a) => Some(a),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anomaly_preserves_info() {
        let a = Anomaly::with_info("nope", Value::from(7i64));
        let err: Error = a.clone().into();
        assert!(err.is_anomaly());
        assert_eq!(err.as_anomaly().unwrap().info, Value::from(7i64));
        assert_eq!(err.to_string(), "nope");
    }

    #[test]
    fn timeout_names_the_conversation() {
        let err = Error::Timeout {
            c: 12,
            timeout: Duration::from_millis(50),
        };
        assert!(err.to_string().contains("12"));
        assert!(!err.is_anomaly());
    }
}
