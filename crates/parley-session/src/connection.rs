//! The conversation multiplexer.
//!
//! A [`MessageConnection`] turns a raw [`Transport`] into a bidirectional
//! request/response endpoint. Either side may issue requests; a single
//! request may yield zero, one, or many streamed responses. Conversation
//! numbers come from a process-wide monotonic generator, so connections
//! sharing one transport route without coordination: a connection that does
//! not own an inbound conversation number simply finds no queue and drops
//! the message.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, error, warn};
use uuid::Uuid;

use parley_wire::{
    next_conversation_id, sign, verify, AnomalyPayload, ErrorPayload, Message, MessageType, Value,
};

use crate::queue::{deadline_queue, DeadlineQueue, QueueSender};
use crate::{Anomaly, Error, IngressHandler, Transport};

/// Default per-read response deadline.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Payload transform applied at the connection boundary.
pub type PayloadTransform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Connection configuration.
#[derive(Clone, Default)]
pub struct Config {
    /// Per-read deadline on response queues. Defaults to 5000 ms.
    pub response_timeout: Option<Duration>,
    /// When set, outbound messages are signed and inbound messages verified.
    pub sign_salt: Option<String>,
    /// Applied to outbound request/response payloads before transmission.
    pub marshal_payload: Option<PayloadTransform>,
    /// Applied to inbound request/response payloads before delivery.
    pub unmarshal_payload: Option<PayloadTransform>,
}

impl Config {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn with_sign_salt(mut self, salt: impl Into<String>) -> Self {
        self.sign_salt = Some(salt.into());
        self
    }

    pub fn with_marshal_payload(mut self, transform: PayloadTransform) -> Self {
        self.marshal_payload = Some(transform);
        self
    }

    pub fn with_unmarshal_payload(mut self, transform: PayloadTransform) -> Self {
        self.unmarshal_payload = Some(transform);
        self
    }

    fn response_timeout(&self) -> Duration {
        self.response_timeout.unwrap_or(DEFAULT_RESPONSE_TIMEOUT)
    }
}

/// What a receive handler hands back.
///
/// `None` suppresses the reply entirely (the fire-and-forget contract).
/// Present-but-falsy values (`Null`, `0`, `""`) are real single responses.
pub enum Response {
    None,
    Single(Value),
    Stream(BoxStream<'static, Value>),
}

impl Response {
    /// A stream response built from an iterator of values.
    pub fn stream_of<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Response::Stream(stream::iter(items).boxed())
    }
}

impl From<Value> for Response {
    fn from(v: Value) -> Self {
        Response::Single(v)
    }
}

/// Application-supplied request handler.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, conn: MessageConnection, payload: Value) -> Result<Response, Error>;
}

#[async_trait]
impl<H: RequestHandler + ?Sized> RequestHandler for Arc<H> {
    async fn handle(&self, conn: MessageConnection, payload: Value) -> Result<Response, Error> {
        (**self).handle(conn, payload).await
    }
}

/// Adapt an async closure into a [`RequestHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(MessageConnection, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, Error>> + Send + 'static,
{
    FnHandler(f)
}

pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(MessageConnection, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, Error>> + Send + 'static,
{
    async fn handle(&self, conn: MessageConnection, payload: Value) -> Result<Response, Error> {
        (self.0)(conn, payload).await
    }
}

/// Which side of a conversation a summary describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perspective {
    Requester,
    Responder,
}

/// A response message with its elapsed time since the request.
#[derive(Debug, Clone)]
pub struct TimedMessage {
    pub message: Message,
    pub elapsed: Duration,
}

/// Summary handed to the conversation hook once per completed conversation.
#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub perspective: Perspective,
    pub request: Message,
    pub responses: Vec<TimedMessage>,
}

type ConversationHook = Arc<dyn Fn(ConversationSummary) + Send + Sync>;

/// Result of the low-level [`MessageConnection::request`] call.
pub enum Reply {
    Single(Value),
    Stream(ResponseStream),
}

/// Lazy, single-pass sequence of streamed response payloads.
pub type ResponseStream = BoxStream<'static, Result<Value, Error>>;

struct Inner {
    id: String,
    transport: Arc<dyn Transport>,
    config: Config,
    queues: Mutex<HashMap<u64, QueueSender<Message>>>,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    conversation_hook: RwLock<Option<ConversationHook>>,
    data: Mutex<HashMap<String, Value>>,
}

/// One endpoint of a conversation-multiplexed connection.
///
/// Cheap to clone; all clones share the same state. The connection lives
/// until its transport closes and carries one source id (`s`) generated at
/// birth.
#[derive(Clone)]
pub struct MessageConnection {
    inner: Arc<Inner>,
}

impl MessageConnection {
    /// Create a connection over a dedicated transport with default config.
    pub async fn new(transport: impl Transport) -> Self {
        Self::with_config(transport, Config::default()).await
    }

    /// Create a connection over a dedicated transport.
    pub async fn with_config(transport: impl Transport, config: Config) -> Self {
        Self::shared(Arc::new(transport), config).await
    }

    /// Create a connection over a (possibly shared) transport.
    pub async fn shared(transport: Arc<dyn Transport>, config: Config) -> Self {
        let inner = Arc::new(Inner {
            id: Uuid::new_v4().to_string(),
            transport: transport.clone(),
            config,
            queues: Mutex::new(HashMap::new()),
            handler: RwLock::new(None),
            conversation_hook: RwLock::new(None),
            data: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        let ingress: IngressHandler = Arc::new(move |msg| dispatch_entry(weak.clone(), msg));
        transport.on_receive(ingress).await;

        Self { inner }
    }

    /// This connection's source id (`s` on every outbound message).
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Install the receive handler invoked for inbound requests.
    pub fn set_receive_handler(&self, handler: impl RequestHandler) {
        *self.inner.handler.write().expect("handler slot") = Some(Arc::new(handler));
    }

    /// Install the hook fired once per completed conversation.
    pub fn set_conversation_handler(
        &self,
        hook: impl Fn(ConversationSummary) + Send + Sync + 'static,
    ) {
        *self.inner.conversation_hook.write().expect("hook slot") = Some(Arc::new(hook));
    }

    /// Read a key from the connection-local data map. Never serialized.
    pub fn get_data(&self, key: &str) -> Option<Value> {
        self.inner.data.lock().expect("data map").get(key).cloned()
    }

    /// Write a key into the connection-local data map.
    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        self.inner
            .data
            .lock()
            .expect("data map")
            .insert(key.into(), value);
    }

    /// Number of conversations with a live response queue.
    pub fn active_conversation_count(&self) -> usize {
        self.inner.queues.lock().expect("queue map").len()
    }

    /// Fire-and-forget: transmit a request and expect nothing back.
    ///
    /// Completes when the transport accepts the bytes; no response queue is
    /// allocated.
    pub async fn send(&self, payload: Value) -> Result<(), Error> {
        let c = next_conversation_id();
        let msg = self.build_request(c, payload)?;
        self.inner.transport.send(msg).await
    }

    /// Expect a single logical result.
    ///
    /// If the responder streamed, the stream is drained: the first element
    /// is kept, the rest discarded with a warning.
    pub async fn request_one(&self, payload: Value) -> Result<Value, Error> {
        match self.request(payload).await? {
            Reply::Single(value) => Ok(value),
            Reply::Stream(mut stream) => {
                warn!("requestOne received a stream; keeping the first element");
                let mut first: Option<Value> = None;
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(value) => {
                            if first.is_none() {
                                first = Some(value);
                            }
                        }
                        Err(err) if first.is_none() => return Err(err),
                        Err(err) => {
                            debug!(error = %err, "ignoring stream error after first element");
                        }
                    }
                }
                Ok(first.unwrap_or(Value::Null))
            }
        }
    }

    /// Always receive a lazy sequence.
    ///
    /// A responder that returned a single value yields a one-element stream.
    pub async fn request_multi(&self, payload: Value) -> Result<ResponseStream, Error> {
        match self.request(payload).await? {
            Reply::Stream(stream) => Ok(stream),
            Reply::Single(value) => Ok(stream::once(async move { Ok(value) }).boxed()),
        }
    }

    /// The low-level request form.
    ///
    /// Returns [`Reply::Single`] or [`Reply::Stream`] depending on the type
    /// of the first inbound response.
    pub async fn request(&self, payload: Value) -> Result<Reply, Error> {
        let c = next_conversation_id();
        let request = self.build_request(c, payload)?;

        let timeout = self.inner.config.response_timeout();
        let (queue_tx, mut queue) = deadline_queue::<Message>(timeout);
        self.inner
            .queues
            .lock()
            .expect("queue map")
            .insert(c, queue_tx);

        let started = Instant::now();
        if let Err(err) = self.inner.transport.send(request.clone()).await {
            self.remove_queue(c);
            return Err(err);
        }

        let first = match queue.next().await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                // The queue only closes without a terminal when the
                // connection is torn down.
                self.remove_queue(c);
                return Err(Error::SocketClosed(format!(
                    "conversation {c} closed before a terminal message"
                )));
            }
            Err(_) => {
                self.remove_queue(c);
                return Err(Error::Timeout { c, timeout });
            }
        };

        let first_timed = TimedMessage {
            message: first.clone(),
            elapsed: started.elapsed(),
        };

        match first.t {
            MessageType::Response => {
                self.fire_conversation_hook(Perspective::Requester, request, vec![first_timed]);
                Ok(Reply::Single(first.p))
            }
            MessageType::Error => {
                self.fire_conversation_hook(Perspective::Requester, request, vec![first_timed]);
                Err(remote_error(&first.p))
            }
            MessageType::Anomaly => {
                self.fire_conversation_hook(Perspective::Requester, request, vec![first_timed]);
                Err(remote_anomaly(&first.p))
            }
            MessageType::End => {
                // Empty stream: the responder yielded nothing.
                self.fire_conversation_hook(Perspective::Requester, request, vec![first_timed]);
                Ok(Reply::Stream(stream::empty().boxed()))
            }
            MessageType::Multi => Ok(Reply::Stream(self.clone().response_stream(
                c,
                queue,
                request,
                started,
                first,
            ))),
            MessageType::Request => {
                // Requests are never routed into response queues.
                self.remove_queue(c);
                Err(Error::Transport(format!(
                    "conversation {c} received a request in response position"
                )))
            }
        }
    }

    /// Close the underlying transport and tear down open conversations.
    pub async fn close(&self) -> Result<(), Error> {
        self.inner.queues.lock().expect("queue map").clear();
        self.inner.transport.close().await
    }

    fn build_request(&self, c: u64, payload: Value) -> Result<Message, Error> {
        let payload = self.marshal(payload);
        let mut msg = Message::request(c, self.inner.id.clone(), payload);
        self.sign_outbound(&mut msg)?;
        Ok(msg)
    }

    fn marshal(&self, payload: Value) -> Value {
        match &self.inner.config.marshal_payload {
            Some(transform) => transform(payload),
            None => payload,
        }
    }

    fn unmarshal(&self, payload: Value) -> Value {
        match &self.inner.config.unmarshal_payload {
            Some(transform) => transform(payload),
            None => payload,
        }
    }

    fn sign_outbound(&self, msg: &mut Message) -> Result<(), Error> {
        if let Some(salt) = &self.inner.config.sign_salt {
            sign(msg, salt)?;
        }
        Ok(())
    }

    fn remove_queue(&self, c: u64) {
        self.inner.queues.lock().expect("queue map").remove(&c);
    }

    fn fire_conversation_hook(
        &self,
        perspective: Perspective,
        request: Message,
        responses: Vec<TimedMessage>,
    ) {
        let hook = self
            .inner
            .conversation_hook
            .read()
            .expect("hook slot")
            .clone();
        if let Some(hook) = hook {
            hook(ConversationSummary {
                perspective,
                request,
                responses,
            });
        }
    }

    /// Lazy sequence over the remainder of a streamed conversation.
    ///
    /// Pins the source of the first response; later messages from a
    /// different source are dropped with a warning. Ends on `end`, throws on
    /// `error`/`anomaly`, and surfaces a timeout if any inter-message gap
    /// exceeds the response deadline.
    fn response_stream(
        self,
        c: u64,
        queue: DeadlineQueue<Message>,
        request: Message,
        started: Instant,
        first: Message,
    ) -> ResponseStream {
        struct StreamState {
            conn: MessageConnection,
            c: u64,
            queue: DeadlineQueue<Message>,
            pinned_source: String,
            request: Message,
            started: Instant,
            responses: Vec<TimedMessage>,
            pending_first: Option<Value>,
        }

        let state = StreamState {
            conn: self,
            c,
            pinned_source: first.s.clone(),
            request,
            started,
            responses: vec![TimedMessage {
                message: first.clone(),
                elapsed: started.elapsed(),
            }],
            pending_first: Some(first.p),
            queue,
        };

        stream::unfold(Some(state), |state| async move {
            let mut state = state?;

            if let Some(first) = state.pending_first.take() {
                return Some((Ok(first), Some(state)));
            }

            loop {
                let msg = match state.queue.next().await {
                    Ok(Some(msg)) => msg,
                    Ok(None) => {
                        debug!(c = state.c, "stream queue closed without a terminal");
                        return Some((
                            Err(Error::SocketClosed(format!(
                                "conversation {} closed mid-stream",
                                state.c
                            ))),
                            None,
                        ));
                    }
                    Err(_) => {
                        state.conn.remove_queue(state.c);
                        let timeout = state.queue.max_wait();
                        return Some((Err(Error::Timeout { c: state.c, timeout }), None));
                    }
                };

                if msg.s != state.pinned_source {
                    warn!(
                        c = state.c,
                        expected = %state.pinned_source,
                        got = %msg.s,
                        "dropping stream response from a divergent source"
                    );
                    continue;
                }

                state.responses.push(TimedMessage {
                    message: msg.clone(),
                    elapsed: state.started.elapsed(),
                });

                match msg.t {
                    MessageType::Multi => {
                        return Some((Ok(msg.p), Some(state)));
                    }
                    MessageType::End => {
                        state.conn.fire_conversation_hook(
                            Perspective::Requester,
                            state.request.clone(),
                            std::mem::take(&mut state.responses),
                        );
                        return None;
                    }
                    MessageType::Error => {
                        state.conn.fire_conversation_hook(
                            Perspective::Requester,
                            state.request.clone(),
                            std::mem::take(&mut state.responses),
                        );
                        return Some((Err(remote_error(&msg.p)), None));
                    }
                    MessageType::Anomaly => {
                        state.conn.fire_conversation_hook(
                            Perspective::Requester,
                            state.request.clone(),
                            std::mem::take(&mut state.responses),
                        );
                        return Some((Err(remote_anomaly(&msg.p)), None));
                    }
                    other => {
                        warn!(c = state.c, t = %other, "unexpected message type mid-stream");
                        state.responses.pop();
                        continue;
                    }
                }
            }
        })
        .boxed()
    }

    /// Route one inbound message.
    async fn dispatch_inbound(&self, mut msg: Message) {
        // Own echoes come back on broadcast substrates; never process them.
        if msg.s == self.inner.id {
            return;
        }

        if let Some(salt) = &self.inner.config.sign_salt {
            if let Err(err) = verify(&msg, salt) {
                error!(c = msg.c, %err, "dropping message that failed verification");
                return;
            }
        }

        match msg.t {
            MessageType::Request => {
                eprintln!("DEBUG dispatch_inbound: Request c={}", msg.c);
                msg.p = self.unmarshal(msg.p);
                let conn = self.clone();
                tokio::spawn(async move { conn.handle_request(msg).await });
            }
            MessageType::Response | MessageType::Multi => {
                msg.p = self.unmarshal(msg.p);
                self.route_response(msg);
            }
            MessageType::End | MessageType::Error | MessageType::Anomaly => {
                self.route_response(msg);
            }
        }
    }

    /// Deliver a response-family message to its conversation queue.
    ///
    /// Terminal types also flush the queue. Messages for conversations this
    /// connection does not own are dropped silently; that is what makes
    /// transport sharing safe.
    fn route_response(&self, msg: Message) {
        let terminal = msg.t.is_terminal();
        let mut queues = self.inner.queues.lock().expect("queue map");
        match queues.get(&msg.c) {
            Some(sender) => {
                let c = msg.c;
                sender.enqueue(msg);
                if terminal {
                    if let Some(sender) = queues.remove(&c) {
                        sender.flush();
                    }
                }
            }
            None => {
                debug!(c = msg.c, t = %msg.t, "no queue for conversation; dropping");
            }
        }
    }

    /// Invoke the receive handler for an inbound request and send back
    /// whatever it produces.
    async fn handle_request(&self, request: Message) {
        let handler = self.inner.handler.read().expect("handler slot").clone();
        let Some(handler) = handler else {
            error!(c = request.c, "{}", Error::NoHandler);
            return;
        };

        let started = Instant::now();
        let c = request.c;
        let mut responses: Vec<TimedMessage> = Vec::new();

        let result = handler.handle(self.clone(), request.p.clone()).await;

        match result {
            Ok(Response::None) => {}
            Ok(Response::Single(value)) => {
                let msg = Message::response(c, self.inner.id.clone(), self.marshal(value));
                self.send_response(msg, started, &mut responses).await;
            }
            Ok(Response::Stream(mut items)) => {
                while let Some(value) = items.next().await {
                    let msg = Message::multi(c, self.inner.id.clone(), self.marshal(value));
                    self.send_response(msg, started, &mut responses).await;
                }
                let msg = Message::end(c, self.inner.id.clone());
                self.send_response(msg, started, &mut responses).await;
            }
            Err(Error::Anomaly(anomaly)) => {
                let payload = AnomalyPayload {
                    message: anomaly.message,
                    info: anomaly.info,
                    request_payload: request.p.clone(),
                };
                let msg = Message::anomaly(c, self.inner.id.clone(), &payload);
                self.send_response(msg, started, &mut responses).await;
            }
            Err(err) => {
                let payload = ErrorPayload {
                    message: err.to_string(),
                    request_payload: request.p.clone(),
                };
                let msg = Message::error(c, self.inner.id.clone(), &payload);
                self.send_response(msg, started, &mut responses).await;
            }
        }

        self.fire_conversation_hook(Perspective::Responder, request, responses);
    }

    async fn send_response(
        &self,
        mut msg: Message,
        started: Instant,
        responses: &mut Vec<TimedMessage>,
    ) {
        if let Err(err) = self.sign_outbound(&mut msg) {
            error!(c = msg.c, %err, "failed to sign response");
            return;
        }
        responses.push(TimedMessage {
            message: msg.clone(),
            elapsed: started.elapsed(),
        });
        if let Err(err) = self.inner.transport.send(msg).await {
            error!(%err, "failed to send response");
        }
    }
}

fn dispatch_entry(weak: Weak<Inner>, msg: Message) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if let Some(inner) = weak.upgrade() {
            MessageConnection { inner }.dispatch_inbound(msg).await;
        }
    })
}

fn remote_error(payload: &Value) -> Error {
    match ErrorPayload::from_value(payload) {
        Some(p) => Error::Remote { message: p.message },
        None => Error::Remote {
            message: "malformed error payload".into(),
        },
    }
}

fn remote_anomaly(payload: &Value) -> Error {
    match AnomalyPayload::from_value(payload) {
        Some(p) => Error::Anomaly(Anomaly {
            message: p.message,
            info: p.info,
        }),
        None => Error::Remote {
            message: "malformed anomaly payload".into(),
        },
    }
}
