//! Server-side socket transport.
//!
//! A thin wrapper around one accepted WebSocket: `send` writes a single JSON
//! text frame, inbound frames deserialize and fan to the installed handlers,
//! and `close` performs the graceful close handshake, resolving only once
//! the peer-close event has been observed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use parley_session::{parse_wire_message, Error, IngressHandler, Transport};
use parley_wire::Message;

type ServerSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type HandlerList = Arc<Mutex<Vec<IngressHandler>>>;
type CloseHook = Box<dyn FnOnce() + Send>;

/// Transport over one accepted server-side socket.
pub struct WsServerTransport {
    sink: Arc<tokio::sync::Mutex<ServerSink>>,
    handlers: HandlerList,
    close_hook: Arc<Mutex<Option<CloseHook>>>,
    closed: Arc<AtomicBool>,
    peer_closed: Arc<Notify>,
}

impl WsServerTransport {
    /// Wrap an upgraded socket and start reading frames.
    pub fn new(socket: WebSocketStream<TcpStream>) -> Self {
        let (sink, stream) = socket.split();
        let sink = Arc::new(tokio::sync::Mutex::new(sink));
        let handlers: HandlerList = Arc::new(Mutex::new(Vec::new()));
        let close_hook: Arc<Mutex<Option<CloseHook>>> = Arc::new(Mutex::new(None));
        let closed = Arc::new(AtomicBool::new(false));
        let peer_closed = Arc::new(Notify::new());

        tokio::spawn(read_loop(
            stream,
            sink.clone(),
            handlers.clone(),
            close_hook.clone(),
            closed.clone(),
            peer_closed.clone(),
        ));

        Self {
            sink,
            handlers,
            close_hook,
            closed,
            peer_closed,
        }
    }

    /// Install a hook invoked once, when the socket closes for any reason.
    ///
    /// If the socket is already closed, the hook runs immediately. The hook
    /// slot and the closed flag share a lock so the hook fires exactly once
    /// no matter how installation races with teardown.
    pub fn set_close_hook(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut slot = self.close_hook.lock().expect("close hook");
            if !self.closed.load(Ordering::Acquire) {
                *slot = Some(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// Whether the socket is still up.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for WsServerTransport {
    async fn send(&self, msg: Message) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SocketClosed("server socket closed".into()));
        }
        let text = msg.to_wire_text()?;
        self.sink
            .lock()
            .await
            .send(WsMessage::text(text))
            .await
            .map_err(|e| Error::Transport(format!("websocket send failed: {e}")))
    }

    async fn on_receive(&self, handler: IngressHandler) {
        self.handlers.lock().expect("handler list").push(handler);
    }

    async fn close(&self) -> Result<(), Error> {
        let notified = self.peer_closed.notified();
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let close_frame = WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "normal".into(),
        }));
        if let Err(err) = self.sink.lock().await.send(close_frame).await {
            debug!(%err, "close frame send failed; socket likely already down");
            return Ok(());
        }
        notified.await;
        Ok(())
    }
}

async fn read_loop(
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    sink: Arc<tokio::sync::Mutex<ServerSink>>,
    handlers: HandlerList,
    close_hook: Arc<Mutex<Option<CloseHook>>>,
    closed: Arc<AtomicBool>,
    peer_closed: Arc<Notify>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                dispatch(text.as_str(), &handlers).await;
            }
            Ok(WsMessage::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => dispatch(text, &handlers).await,
                Err(err) => warn!(%err, "dropping non-UTF-8 binary frame"),
            },
            Ok(WsMessage::Ping(data)) => {
                let _ = sink.lock().await.send(WsMessage::Pong(data)).await;
            }
            Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_)) => {}
            Ok(WsMessage::Close(_)) => break,
            Err(err) => {
                debug!(%err, "server socket read error");
                break;
            }
        }
    }

    let hook = {
        let mut slot = close_hook.lock().expect("close hook");
        closed.store(true, Ordering::Release);
        slot.take()
    };
    peer_closed.notify_waiters();
    if let Some(hook) = hook {
        hook();
    }
}

async fn dispatch(text: &str, handlers: &HandlerList) {
    let msg = match parse_wire_message(text) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(%err, "dropping unparseable frame");
            return;
        }
    };
    let installed: Vec<IngressHandler> = handlers.lock().expect("handler list").clone();
    for handler in installed {
        handler(msg.clone()).await;
    }
}
