//! Reconnecting client socket transport.
//!
//! The socket is not opened until the first send. A send while connecting
//! awaits the open event; a send while closing awaits the close and then
//! fails with the close reason. After any close the socket reference is
//! cleared, so the next send transparently reconnects.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use parley_session::{parse_wire_message, Error, IngressHandler, Transport};
use parley_wire::Message;

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ClientSink = SplitSink<ClientSocket, WsMessage>;
type HandlerList = Arc<StdMutex<Vec<IngressHandler>>>;
type CloseHook = Arc<dyn Fn(String) + Send + Sync>;

enum State {
    Disconnected,
    Connecting,
    Open(ClientSink),
    Closing,
}

impl State {
    fn tag(&self) -> &'static str {
        match self {
            State::Disconnected => "disconnected",
            State::Connecting => "connecting",
            State::Open(_) => "open",
            State::Closing => "closing",
        }
    }
}

struct Shared {
    url: String,
    state: Mutex<State>,
    changed: Notify,
    handlers: HandlerList,
    close_hook: StdMutex<Option<CloseHook>>,
    last_close_reason: StdMutex<String>,
}

/// Lazily connecting, transparently reconnecting client transport.
pub struct WsClientTransport {
    shared: Arc<Shared>,
}

impl WsClientTransport {
    /// Record the URL; no socket is opened until the first send.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                state: Mutex::new(State::Disconnected),
                changed: Notify::new(),
                handlers: Arc::new(StdMutex::new(Vec::new())),
                close_hook: StdMutex::new(None),
                last_close_reason: StdMutex::new(String::new()),
            }),
        }
    }

    /// The URL this transport connects to.
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Whether the underlying socket is currently open.
    pub async fn is_open(&self) -> bool {
        matches!(*self.shared.state.lock().await, State::Open(_))
    }

    /// Hook fired with the close reason whenever the socket closes.
    pub fn set_close_hook(&self, hook: impl Fn(String) + Send + Sync + 'static) {
        *self.shared.close_hook.lock().expect("close hook") = Some(Arc::new(hook));
    }

    /// Open the socket now instead of waiting for the first send.
    pub async fn connect(&self) -> Result<(), Error> {
        loop {
            let notified = self.shared.changed.notified();
            let mut state = self.shared.state.lock().await;
            match &*state {
                State::Open(_) => return Ok(()),
                State::Disconnected => {
                    *state = State::Connecting;
                    drop(state);
                    return establish(&self.shared).await;
                }
                State::Connecting | State::Closing => {
                    drop(state);
                    notified.await;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for WsClientTransport {
    async fn send(&self, msg: Message) -> Result<(), Error> {
        let text = msg.to_wire_text()?;
        loop {
            let notified = self.shared.changed.notified();
            let mut state = self.shared.state.lock().await;
            match &mut *state {
                State::Open(sink) => {
                    return sink
                        .send(WsMessage::text(text))
                        .await
                        .map_err(|e| Error::Transport(format!("websocket send failed: {e}")));
                }
                State::Disconnected => {
                    *state = State::Connecting;
                    drop(state);
                    establish(&self.shared).await?;
                }
                State::Connecting => {
                    debug!(state = "connecting", "send awaiting open event");
                    drop(state);
                    notified.await;
                }
                State::Closing => {
                    drop(state);
                    notified.await;
                    let reason = self
                        .shared
                        .last_close_reason
                        .lock()
                        .expect("close reason")
                        .clone();
                    return Err(Error::SocketClosed(reason));
                }
            }
        }
    }

    async fn on_receive(&self, handler: IngressHandler) {
        self.shared
            .handlers
            .lock()
            .expect("handler list")
            .push(handler);
    }

    async fn close(&self) -> Result<(), Error> {
        loop {
            let notified = self.shared.changed.notified();
            let mut state = self.shared.state.lock().await;
            match &mut *state {
                State::Disconnected => return Ok(()),
                State::Open(sink) => {
                    let frame = WsMessage::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "normal".into(),
                    }));
                    if sink.send(frame).await.is_err() {
                        // Socket already torn down under us; the reader will
                        // transition the state shortly.
                        debug!("close frame send failed");
                    }
                    *state = State::Closing;
                    drop(state);
                    notified.await;
                }
                State::Connecting | State::Closing => {
                    drop(state);
                    notified.await;
                }
            }
        }
    }
}

/// Connect, install the reader, and move to `Open`.
///
/// Entered with the state already set to `Connecting` by the caller.
async fn establish(shared: &Arc<Shared>) -> Result<(), Error> {
    match connect_async(shared.url.as_str()).await {
        Ok((socket, _response)) => {
            let (sink, stream) = socket.split();
            tokio::spawn(read_loop(stream, shared.clone()));
            *shared.state.lock().await = State::Open(sink);
            shared.changed.notify_waiters();
            Ok(())
        }
        Err(err) => {
            *shared.state.lock().await = State::Disconnected;
            shared.changed.notify_waiters();
            Err(Error::Connect(format!(
                "unable to connect to {}: {err}",
                shared.url
            )))
        }
    }
}

async fn read_loop(mut stream: SplitStream<ClientSocket>, shared: Arc<Shared>) {
    let mut reason = String::from("connection closed");
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                dispatch(text.as_str(), &shared.handlers).await;
            }
            Ok(WsMessage::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => dispatch(text, &shared.handlers).await,
                Err(err) => warn!(%err, "dropping non-UTF-8 binary frame"),
            },
            Ok(WsMessage::Ping(data)) => {
                if let State::Open(sink) = &mut *shared.state.lock().await {
                    let _ = sink.send(WsMessage::Pong(data)).await;
                }
            }
            Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_)) => {}
            Ok(WsMessage::Close(frame)) => {
                if let Some(frame) = frame {
                    if !frame.reason.is_empty() {
                        reason = frame.reason.to_string();
                    }
                }
                break;
            }
            Err(err) => {
                reason = err.to_string();
                break;
            }
        }
    }

    // Clear the socket reference so the next send reconnects.
    {
        let mut state = shared.state.lock().await;
        debug!(from = state.tag(), %reason, "client socket closed");
        *state = State::Disconnected;
    }
    *shared.last_close_reason.lock().expect("close reason") = reason.clone();
    shared.changed.notify_waiters();

    let hook = shared.close_hook.lock().expect("close hook").clone();
    if let Some(hook) = hook {
        hook(reason);
    }
}

async fn dispatch(text: &str, handlers: &HandlerList) {
    eprintln!("DEBUG dispatch: got frame {text}");
    let msg = match parse_wire_message(text) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(%err, "dropping unparseable frame");
            return;
        }
    };
    let installed: Vec<IngressHandler> = handlers.lock().expect("handler list").clone();
    eprintln!("DEBUG dispatch: {} handlers installed", installed.len());
    for handler in installed {
        handler(msg.clone()).await;
    }
    eprintln!("DEBUG dispatch: done");
}
