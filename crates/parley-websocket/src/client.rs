//! Per-URL client singleton.
//!
//! [`WebSocketMessageClient::create`] hands out one cached connection per
//! URL, process-wide, riding a reconnecting client transport. Server-push
//! messages fan out to every registered receive handler, each awaited in
//! turn, and produce no response.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use futures::future::BoxFuture;
use tokio::sync::Mutex;

use parley_session::{
    handler_fn, Config as ConnectionConfig, Error, MessageConnection, Response, ResponseStream,
    Transport, Value,
};

use crate::WsClientTransport;

type PushHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;
type PushHandlerList = Arc<StdMutex<Vec<PushHandler>>>;

fn registry() -> &'static Mutex<HashMap<String, WebSocketMessageClient>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, WebSocketMessageClient>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Client-side connection handle, cached per URL.
#[derive(Clone)]
pub struct WebSocketMessageClient {
    connection: MessageConnection,
    transport: Arc<WsClientTransport>,
    push_handlers: PushHandlerList,
}

impl WebSocketMessageClient {
    /// Get or create the cached connection for this URL.
    pub async fn create(url: impl Into<String>) -> Self {
        Self::create_with_config(url, ConnectionConfig::default()).await
    }

    /// Get or create the cached connection for this URL.
    ///
    /// The config only applies when this call creates the connection; later
    /// callers receive the cached instance as-is.
    pub async fn create_with_config(url: impl Into<String>, config: ConnectionConfig) -> Self {
        let url = url.into();
        let mut clients = registry().lock().await;
        if let Some(client) = clients.get(&url) {
            return client.clone();
        }

        let transport = Arc::new(WsClientTransport::new(url.clone()));
        let connection = MessageConnection::shared(transport.clone(), config).await;

        let push_handlers: PushHandlerList = Arc::new(StdMutex::new(Vec::new()));
        let fan_out = push_handlers.clone();
        connection.set_receive_handler(handler_fn(move |_conn, payload: Value| {
            let fan_out = fan_out.clone();
            async move {
                eprintln!("DEBUG client push handler invoked");
                let installed: Vec<PushHandler> =
                    fan_out.lock().expect("push handlers").clone();
                eprintln!("DEBUG client push handler: {} installed", installed.len());
                for handler in installed {
                    handler(payload.clone()).await;
                }
                eprintln!("DEBUG client push handler done");
                Ok(Response::None)
            }
        }));

        let client = Self {
            connection,
            transport,
            push_handlers,
        };
        clients.insert(url, client.clone());
        client
    }

    /// Register an additional handler for server-push messages.
    pub fn add_receive_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: PushHandler = Arc::new(move |payload| {
            let fut: BoxFuture<'static, ()> = Box::pin(handler(payload));
            fut
        });
        self.push_handlers
            .lock()
            .expect("push handlers")
            .push(handler);
    }

    /// The underlying conversation endpoint.
    pub fn connection(&self) -> &MessageConnection {
        &self.connection
    }

    /// Whether the socket is currently open.
    pub async fn is_open(&self) -> bool {
        self.transport.is_open().await
    }

    /// Fire-and-forget request.
    pub async fn send(&self, payload: Value) -> Result<(), Error> {
        self.connection.send(payload).await
    }

    /// Request a single logical result.
    pub async fn request_one(&self, payload: Value) -> Result<Value, Error> {
        self.connection.request_one(payload).await
    }

    /// Request a streamed result.
    pub async fn request_multi(&self, payload: Value) -> Result<ResponseStream, Error> {
        self.connection.request_multi(payload).await
    }

    /// Close the socket and drop this URL from the cache.
    pub async fn close(&self) -> Result<(), Error> {
        registry().lock().await.remove(self.transport.url());
        self.transport.close().await
    }
}
