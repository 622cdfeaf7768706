#![deny(unsafe_code)]

//! Conversation multiplexing for the parley RPC runtime.
//!
//! This crate holds the heart of the system:
//! - [`MessageConnection`]: the conversation state machine over any
//!   [`Transport`]
//! - The [`Transport`] contract itself, plus the in-process [`pipe`]
//!   transport
//! - The deadline-bounded FIFO queue backing response delivery
//! - The error taxonomy, headlined by [`Anomaly`]
//!
//! # Example
//!
//! ```
//! use parley_session::{handler_fn, pipe, MessageConnection, Response, Value};
//!
//! # async fn demo() -> Result<(), parley_session::Error> {
//! let (a, b) = pipe();
//! let requester = MessageConnection::new(a).await;
//! let responder = MessageConnection::new(b).await;
//!
//! responder.set_receive_handler(handler_fn(|_conn, payload: Value| async move {
//!     Ok(Response::Single(payload))
//! }));
//!
//! let reply = requester.request_one(Value::from("hello")).await?;
//! assert_eq!(reply.as_str(), Some("hello"));
//! # Ok(())
//! # }
//! ```

mod connection;
mod error;
mod pipe;
mod queue;
mod transport;

pub use connection::{
    handler_fn, Config, ConversationSummary, FnHandler, MessageConnection, PayloadTransform,
    Perspective, Reply, RequestHandler, Response, ResponseStream, TimedMessage,
    DEFAULT_RESPONSE_TIMEOUT,
};
pub use error::{Anomaly, Error};
pub use pipe::{pipe, PipeTransport};
pub use queue::{deadline_queue, DeadlineQueue, Expired, QueueSender};
pub use transport::{parse_wire_message, IngressHandler, Transport};

pub use parley_wire::{Message, MessageType, Value};
