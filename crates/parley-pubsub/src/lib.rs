#![deny(unsafe_code)]

//! Subject-addressed pub/sub transport.
//!
//! Rides a NATS-style broker whose datagrams have a fixed maximum payload,
//! discovered from broker info at connect time. Messages that fit are
//! published whole as UTF-8 JSON; larger ones go through the chunked
//! framing codec in [`chunks`]. Broker connections are pooled and
//! refcounted per configuration, so sibling transports share one socket.
//!
//! Set `PHNQ_MESSAGE_LOG_NATS=1` to log wire traffic to stderr.

mod chunks;
mod pool;

pub use chunks::{
    is_chunk, split_into_chunks, ChunkAssembler, CHUNK_HEADER_LEN, CHUNK_HEADER_PREFIX,
    CHUNK_NONCE_LEN, MAX_CHUNKS, MAX_PENDING_MESSAGES,
};
pub use pool::{BrokerConfig, DEFAULT_CONNECT_TIME_WAIT};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use parley_session::{parse_wire_message, Error, IngressHandler, Transport};
use parley_wire::{Message, MessageType};

type HandlerList = Arc<Mutex<Vec<IngressHandler>>>;

/// One broker subscription this transport listens on.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub subject: String,
    /// Queue-group membership; subjects in the same group share deliveries.
    pub queue_group: Option<String>,
}

impl Subscription {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            queue_group: None,
        }
    }

    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }
}

impl From<&str> for Subscription {
    fn from(subject: &str) -> Self {
        Subscription::new(subject)
    }
}

impl From<String> for Subscription {
    fn from(subject: String) -> Self {
        Subscription::new(subject)
    }
}

/// How outbound messages are mapped to subjects.
#[derive(Clone)]
pub enum PublishSubject {
    /// Every message publishes to one subject.
    Fixed(String),
    /// Per-message resolution; `None` means the message has no subject.
    Resolver(Arc<dyn Fn(&Message) -> Option<String> + Send + Sync>),
}

impl PublishSubject {
    pub fn resolver(
        f: impl Fn(&Message) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        PublishSubject::Resolver(Arc::new(f))
    }

    fn resolve(&self, msg: &Message) -> Option<String> {
        match self {
            PublishSubject::Fixed(subject) => Some(subject.clone()),
            PublishSubject::Resolver(f) => f(msg),
        }
    }
}

/// Transport configuration.
#[derive(Clone)]
pub struct PubSubConfig {
    pub broker: BrokerConfig,
    pub subscriptions: Vec<Subscription>,
    pub publish_subject: Option<PublishSubject>,
}

impl PubSubConfig {
    pub fn new(broker: BrokerConfig) -> Self {
        Self {
            broker,
            subscriptions: Vec::new(),
            publish_subject: None,
        }
    }

    pub fn subscribe(mut self, subscription: impl Into<Subscription>) -> Self {
        self.subscriptions.push(subscription.into());
        self
    }

    pub fn publish_to(mut self, subject: impl Into<String>) -> Self {
        self.publish_subject = Some(PublishSubject::Fixed(subject.into()));
        self
    }

    pub fn publish_with(
        mut self,
        resolver: impl Fn(&Message) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.publish_subject = Some(PublishSubject::resolver(resolver));
        self
    }
}

/// Reply routing: `end` messages go back on the subject their conversation
/// has been using, even when the resolver would no longer produce one.
struct ReplyRoutes {
    by_conversation: Mutex<HashMap<u64, String>>,
}

impl ReplyRoutes {
    fn new() -> Self {
        Self {
            by_conversation: Mutex::new(HashMap::new()),
        }
    }

    fn subject_for(
        &self,
        msg: &Message,
        publish_subject: Option<&PublishSubject>,
    ) -> Result<String, Error> {
        if msg.t == MessageType::End {
            if let Some(cached) = self
                .by_conversation
                .lock()
                .expect("reply routes")
                .remove(&msg.c)
            {
                return Ok(cached);
            }
        }

        let resolved = publish_subject.and_then(|p| p.resolve(msg));
        let Some(subject) = resolved else {
            return Err(Error::Transport(format!(
                "no subject resolved for {} message on conversation {}",
                msg.t, msg.c
            )));
        };

        if msg.t != MessageType::End {
            self.by_conversation
                .lock()
                .expect("reply routes")
                .insert(msg.c, subject.clone());
        }
        Ok(subject)
    }
}

fn traffic_log_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var("PHNQ_MESSAGE_LOG_NATS").is_ok_and(|v| v == "1")
    })
}

fn log_traffic(direction: &str, subject: &str, bytes: usize) {
    if traffic_log_enabled() {
        eprintln!("[NATS] {direction} {subject} ({bytes} bytes)");
    }
}

/// Pub/sub transport over a shared broker client.
pub struct PubSubTransport {
    client: async_nats::Client,
    pool_key: u64,
    max_payload: usize,
    publish_subject: Option<PublishSubject>,
    routes: ReplyRoutes,
    handlers: HandlerList,
    subscription_tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PubSubTransport {
    /// Connect to the broker (or join a pooled sibling connection) and start
    /// the configured subscriptions.
    pub async fn connect(config: PubSubConfig) -> Result<Self, Error> {
        let pool_key = config.broker.pool_key();
        let client = pool::acquire(&config.broker).await?;

        let max_payload = client.server_info().max_payload;
        if max_payload == 0 {
            pool::release(pool_key).await;
            return Err(Error::Transport(
                "broker did not report a maximum payload size".into(),
            ));
        }

        let handlers: HandlerList = Arc::new(Mutex::new(Vec::new()));
        let mut subscription_tasks = Vec::new();
        for subscription in &config.subscriptions {
            let subscriber = match &subscription.queue_group {
                Some(group) => {
                    client
                        .queue_subscribe(subscription.subject.clone(), group.clone())
                        .await
                }
                None => client.subscribe(subscription.subject.clone()).await,
            };
            let subscriber = match subscriber {
                Ok(sub) => sub,
                Err(err) => {
                    pool::release(pool_key).await;
                    return Err(Error::Transport(format!(
                        "subscribe to {} failed: {err}",
                        subscription.subject
                    )));
                }
            };
            subscription_tasks.push(tokio::spawn(run_subscription(
                subscriber,
                subscription.subject.clone(),
                handlers.clone(),
            )));
        }

        Ok(Self {
            client,
            pool_key,
            max_payload,
            publish_subject: config.publish_subject,
            routes: ReplyRoutes::new(),
            handlers,
            subscription_tasks: Mutex::new(subscription_tasks),
            closed: AtomicBool::new(false),
        })
    }

    /// The broker's datagram ceiling, as discovered at connect time.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    async fn publish(&self, subject: &str, bytes: Vec<u8>) -> Result<(), Error> {
        log_traffic("-->", subject, bytes.len());
        self.client
            .publish(subject.to_owned(), bytes.into())
            .await
            .map_err(|e| Error::Transport(format!("publish to {subject} failed: {e}")))
    }
}

#[async_trait]
impl Transport for PubSubTransport {
    async fn send(&self, msg: Message) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SocketClosed("pub/sub transport closed".into()));
        }

        let subject = self
            .routes
            .subject_for(&msg, self.publish_subject.as_ref())?;
        let bytes = msg.to_wire_text()?.into_bytes();

        if bytes.len() > self.max_payload {
            let datagrams = split_into_chunks(&bytes, self.max_payload)?;
            debug!(
                subject = %subject,
                chunks = datagrams.len(),
                total = bytes.len(),
                "publishing chunked message"
            );
            for datagram in datagrams {
                self.publish(&subject, datagram).await?;
            }
        } else {
            self.publish(&subject, bytes).await?;
        }
        Ok(())
    }

    async fn on_receive(&self, handler: IngressHandler) {
        self.handlers.lock().expect("handler list").push(handler);
    }

    async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let tasks = std::mem::take(&mut *self.subscription_tasks.lock().expect("tasks"));
        for task in tasks {
            task.abort();
        }
        pool::release(self.pool_key).await;
        Ok(())
    }
}

/// Deliver one subscription's datagrams: reassemble chunks, parse, fan out.
async fn run_subscription(
    mut subscriber: async_nats::Subscriber,
    subject: String,
    handlers: HandlerList,
) {
    let mut assembler = ChunkAssembler::new();
    while let Some(delivery) = subscriber.next().await {
        log_traffic("<--", &subject, delivery.payload.len());

        let complete = if is_chunk(&delivery.payload) {
            assembler.accept(&delivery.payload)
        } else {
            Some(delivery.payload.to_vec())
        };
        let Some(bytes) = complete else { continue };

        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => {
                warn!(subject = %subject, %err, "dropping non-UTF-8 datagram");
                continue;
            }
        };
        let msg = match parse_wire_message(&text) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(subject = %subject, %err, "dropping unparseable datagram");
                continue;
            }
        };

        let installed: Vec<IngressHandler> = handlers.lock().expect("handler list").clone();
        for handler in installed {
            handler(msg.clone()).await;
        }
    }
    debug!(subject = %subject, "subscription ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_wire::Value;

    #[test]
    fn fixed_publish_subject_resolves_for_everything() {
        let routes = ReplyRoutes::new();
        let publish = Some(PublishSubject::Fixed("app.in".to_string()));
        let msg = Message::request(1, "A", Value::from("x"));
        assert_eq!(routes.subject_for(&msg, publish.as_ref()).unwrap(), "app.in");
    }

    #[test]
    fn end_reuses_the_cached_conversation_subject() {
        let routes = ReplyRoutes::new();
        // The resolver only knows how to route multi frames.
        let publish = Some(PublishSubject::resolver(|msg: &Message| {
            (msg.t == MessageType::Multi).then(|| "replies.7".to_string())
        }));

        let multi = Message::multi(7, "B", Value::from("part"));
        assert_eq!(
            routes.subject_for(&multi, publish.as_ref()).unwrap(),
            "replies.7"
        );

        // The end frame resolves to nothing, but rides the cached subject.
        let end = Message::end(7, "B");
        assert_eq!(
            routes.subject_for(&end, publish.as_ref()).unwrap(),
            "replies.7"
        );

        // The cache entry is consumed by the end frame.
        let another_end = Message::end(7, "B");
        assert!(routes.subject_for(&another_end, publish.as_ref()).is_err());
    }

    #[test]
    fn unresolvable_subject_is_fatal() {
        let routes = ReplyRoutes::new();
        let msg = Message::request(3, "A", Value::from("x"));

        let err = routes.subject_for(&msg, None).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));

        let publish = Some(PublishSubject::resolver(|_: &Message| None));
        assert!(routes.subject_for(&msg, publish.as_ref()).is_err());
    }

    #[test]
    fn subscription_conversions() {
        let plain: Subscription = "app.in".into();
        assert_eq!(plain.subject, "app.in");
        assert!(plain.queue_group.is_none());

        let grouped = Subscription::new("app.in").with_queue_group("workers");
        assert_eq!(grouped.queue_group.as_deref(), Some("workers"));
    }

    #[test]
    fn config_builder_accumulates_subscriptions() {
        let config = PubSubConfig::new(BrokerConfig::default())
            .subscribe("app.in")
            .subscribe(Subscription::new("app.priority").with_queue_group("workers"))
            .publish_to("app.out");
        assert_eq!(config.subscriptions.len(), 2);
        assert!(config.publish_subject.is_some());
    }
}
