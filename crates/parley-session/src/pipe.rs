//! In-process pipe transport.
//!
//! The trivial transport: two connected ends that move messages through
//! unbounded channels, one pump task per direction so delivery order is
//! preserved. Useful on its own for wiring two connections inside one
//! process, and as the conformance target the heavier transports are
//! measured against.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use parley_wire::Message;

use crate::{Error, IngressHandler, Transport};

type HandlerList = Arc<Mutex<Vec<IngressHandler>>>;

/// One end of an in-process pipe.
pub struct PipeTransport {
    to_peer: mpsc::UnboundedSender<Message>,
    handlers: HandlerList,
    closed: Arc<AtomicBool>,
}

/// Create a connected pair of pipe transports.
pub fn pipe() -> (PipeTransport, PipeTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let a_handlers: HandlerList = Arc::new(Mutex::new(Vec::new()));
    let b_handlers: HandlerList = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(AtomicBool::new(false));

    tokio::spawn(pump(a_rx, a_handlers.clone()));
    tokio::spawn(pump(b_rx, b_handlers.clone()));

    (
        PipeTransport {
            to_peer: b_tx,
            handlers: a_handlers,
            closed: closed.clone(),
        },
        PipeTransport {
            to_peer: a_tx,
            handlers: b_handlers,
            closed,
        },
    )
}

/// Deliver inbound messages to every installed handler, in order.
async fn pump(mut rx: mpsc::UnboundedReceiver<Message>, handlers: HandlerList) {
    while let Some(msg) = rx.recv().await {
        let installed: Vec<IngressHandler> = handlers.lock().expect("handler list").clone();
        for handler in installed {
            handler(msg.clone()).await;
        }
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn send(&self, msg: Message) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SocketClosed("pipe closed".into()));
        }
        self.to_peer
            .send(msg)
            .map_err(|_| Error::SocketClosed("pipe peer gone".into()))
    }

    async fn on_receive(&self, handler: IngressHandler) {
        self.handlers.lock().expect("handler list").push(handler);
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
