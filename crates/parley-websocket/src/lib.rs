#![deny(unsafe_code)]

//! WebSocket transports for the parley RPC runtime.
//!
//! - [`WsServerTransport`]: one accepted server-side socket
//! - [`WsClientTransport`]: lazily connecting, reconnecting client socket
//! - [`WebSocketMessageServer`]: listener, path allow-list, connection
//!   registry
//! - [`WebSocketMessageClient`]: per-URL connection singleton with
//!   receive-handler fan-out
//!
//! Wire messages travel as JSON text frames. Close codes follow the
//! protocol surface: 1000 for a normal close, 1008 for an upgrade on an
//! unsupported path.

mod client;
mod client_transport;
mod server;
mod server_transport;

pub use client::WebSocketMessageClient;
pub use client_transport::WsClientTransport;
pub use server::{ServerConfig, WebSocketMessageServer};
pub use server_transport::WsServerTransport;
