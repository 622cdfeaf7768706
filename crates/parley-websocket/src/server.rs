//! WebSocket message server.
//!
//! Owns the socket server: upgrades incoming connections, enforces the
//! upgrade-path allow-list, and wires each accepted socket into a
//! [`MessageConnection`] registered by its connection id. Upgrades on an
//! unlisted path are completed and then immediately closed with status 1008.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::SinkExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as UpgradeRequest, Response as UpgradeResponse,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use parley_session::{
    Config as ConnectionConfig, Error, MessageConnection, RequestHandler, Transport,
};

use crate::WsServerTransport;

type ConnectHook = Arc<dyn Fn(MessageConnection) + Send + Sync>;
type DisconnectHook = Arc<dyn Fn(String) + Send + Sync>;

/// Server configuration.
#[derive(Clone, Default)]
pub struct ServerConfig {
    paths: Option<Vec<String>>,
    pub connection: ConnectionConfig,
    on_connect: Option<ConnectHook>,
    on_disconnect: Option<DisconnectHook>,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow upgrades on a single path.
    ///
    /// # Panics
    ///
    /// Panics if an allow-list was already configured; `path` and `paths`
    /// are mutually exclusive.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        if self.paths.is_some() {
            panic!("configure either `path` or `paths`, not both");
        }
        self.paths = Some(vec![path.into()]);
        self
    }

    /// Allow upgrades on a list of paths.
    ///
    /// # Panics
    ///
    /// Panics if an allow-list was already configured; `path` and `paths`
    /// are mutually exclusive.
    pub fn with_paths(mut self, paths: Vec<String>) -> Self {
        if self.paths.is_some() {
            panic!("configure either `path` or `paths`, not both");
        }
        self.paths = Some(paths);
        self
    }

    /// Per-connection settings (timeout, signing, payload transforms).
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Hook fired after a connection is registered.
    pub fn on_connect(mut self, hook: impl Fn(MessageConnection) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    /// Hook fired with the connection id after a connection is deregistered.
    pub fn on_disconnect(mut self, hook: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(hook));
        self
    }

    fn allowed_paths(&self) -> Vec<String> {
        self.paths.clone().unwrap_or_else(|| vec!["/".to_string()])
    }
}

struct Registered {
    connection: MessageConnection,
    transport: Arc<WsServerTransport>,
}

struct ServerInner {
    config: ServerConfig,
    handler: Arc<dyn RequestHandler>,
    connections: Mutex<HashMap<String, Registered>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: SocketAddr,
}

/// The server dispatcher.
#[derive(Clone)]
pub struct WebSocketMessageServer {
    inner: Arc<ServerInner>,
}

impl WebSocketMessageServer {
    /// Bind a listener and start accepting connections.
    ///
    /// Every accepted connection's inbound requests are dispatched to
    /// `handler`.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: ServerConfig,
        handler: impl RequestHandler,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("bind failed: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Transport(e.to_string()))?;

        let inner = Arc::new(ServerInner {
            config,
            handler: Arc::new(handler),
            connections: Mutex::new(HashMap::new()),
            accept_task: Mutex::new(None),
            local_addr,
        });

        let accept_inner = inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted tcp connection");
                        let inner = accept_inner.clone();
                        tokio::spawn(async move {
                            if let Err(err) = upgrade(inner, stream).await {
                                debug!(%err, "connection setup failed");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(%err, "accept failed");
                    }
                }
            }
        });
        *inner.accept_task.lock().expect("accept task") = Some(task);

        info!(addr = %local_addr, "websocket message server listening");
        Ok(Self { inner })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Number of currently registered connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().expect("connections").len()
    }

    /// Look up a registered connection by id.
    pub fn connection(&self, id: &str) -> Option<MessageConnection> {
        self.inner
            .connections
            .lock()
            .expect("connections")
            .get(id)
            .map(|r| r.connection.clone())
    }

    /// Close every registered connection, then stop accepting.
    pub async fn close(&self) -> Result<(), Error> {
        let drained: Vec<Registered> = {
            let mut connections = self.inner.connections.lock().expect("connections");
            connections.drain().map(|(_, r)| r).collect()
        };
        for registered in drained {
            if let Err(err) = registered.transport.close().await {
                warn!(%err, "closing server connection failed");
            }
        }
        if let Some(task) = self.inner.accept_task.lock().expect("accept task").take() {
            task.abort();
        }
        Ok(())
    }
}

/// Upgrade one socket, enforce the path allow-list, and register the
/// resulting connection.
async fn upgrade(inner: Arc<ServerInner>, stream: TcpStream) -> Result<(), Error> {
    let requested = Arc::new(Mutex::new(String::new()));
    let requested_slot = requested.clone();
    let mut socket = accept_hdr_async(
        stream,
        move |req: &UpgradeRequest, resp: UpgradeResponse| {
            *requested_slot.lock().expect("path slot") = req.uri().to_string();
            Ok(resp)
        },
    )
    .await
    .map_err(|e| Error::Transport(format!("websocket upgrade failed: {e}")))?;

    let url = requested.lock().expect("path slot").clone();
    let path = url.split('?').next().unwrap_or(&url).to_string();

    if !inner.config.allowed_paths().iter().any(|p| p == &path) {
        warn!(%url, "rejecting upgrade on unsupported path");
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: format!("unsupported path: {url}").into(),
            })))
            .await;
        return Ok(());
    }

    let transport = Arc::new(WsServerTransport::new(socket));
    let connection = MessageConnection::shared(
        transport.clone() as Arc<dyn Transport>,
        inner.config.connection.clone(),
    )
    .await;
    connection.set_receive_handler(inner.handler.clone());

    let id = connection.id().to_string();
    inner.connections.lock().expect("connections").insert(
        id.clone(),
        Registered {
            connection: connection.clone(),
            transport: transport.clone(),
        },
    );
    info!(id = %id, path = %path, "connection registered");

    let hook_inner = inner.clone();
    let hook_id = id.clone();
    transport.set_close_hook(move || {
        hook_inner
            .connections
            .lock()
            .expect("connections")
            .remove(&hook_id);
        debug!(id = %hook_id, "connection deregistered");
        if let Some(on_disconnect) = &hook_inner.config.on_disconnect {
            on_disconnect(hook_id.clone());
        }
    });

    if let Some(on_connect) = &inner.config.on_connect {
        on_connect(connection);
    }
    Ok(())
}
