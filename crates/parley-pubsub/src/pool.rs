//! Shared, refcounted broker client pool.
//!
//! Transports with identical broker configuration share one underlying
//! connection; the connection closes only when the last transport using it
//! releases its hold. The pool is process-wide.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use parley_session::Error;

/// Default wait between connect attempts.
pub const DEFAULT_CONNECT_TIME_WAIT: Duration = Duration::from_millis(2000);

/// Broker connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerConfig {
    /// Broker addresses, e.g. `nats://127.0.0.1:4222`.
    pub servers: Vec<String>,
    /// Connect attempts before giving up; `-1` retries forever.
    pub max_connect_attempts: i32,
    /// Sleep between connect attempts, in milliseconds.
    pub connect_time_wait_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://127.0.0.1:4222".to_string()],
            max_connect_attempts: 1,
            connect_time_wait_ms: DEFAULT_CONNECT_TIME_WAIT.as_millis() as u64,
        }
    }
}

impl BrokerConfig {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            ..Self::default()
        }
    }

    pub fn with_max_connect_attempts(mut self, attempts: i32) -> Self {
        self.max_connect_attempts = attempts;
        self
    }

    pub fn with_connect_time_wait(mut self, wait: Duration) -> Self {
        self.connect_time_wait_ms = wait.as_millis() as u64;
        self
    }

    /// Pool key: connections are deduplicated by configuration hash.
    pub fn pool_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    fn connect_time_wait(&self) -> Duration {
        Duration::from_millis(self.connect_time_wait_ms)
    }
}

struct PooledClient {
    client: async_nats::Client,
    refs: usize,
}

fn pool() -> &'static Mutex<HashMap<u64, PooledClient>> {
    static POOL: OnceLock<Mutex<HashMap<u64, PooledClient>>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Take a hold on the shared client for this configuration, connecting if
/// no sibling transport already has.
pub(crate) async fn acquire(config: &BrokerConfig) -> Result<async_nats::Client, Error> {
    let key = config.pool_key();
    let mut clients = pool().lock().await;

    if let Some(entry) = clients.get_mut(&key) {
        entry.refs += 1;
        debug!(key, refs = entry.refs, "reusing pooled broker client");
        return Ok(entry.client.clone());
    }

    let client = connect_with_retry(config).await?;
    clients.insert(
        key,
        PooledClient {
            client: client.clone(),
            refs: 1,
        },
    );
    Ok(client)
}

/// Release one hold; closes the broker connection on the last release.
pub(crate) async fn release(key: u64) {
    let mut clients = pool().lock().await;
    let Some(entry) = clients.get_mut(&key) else {
        return;
    };
    entry.refs -= 1;
    if entry.refs > 0 {
        debug!(key, refs = entry.refs, "released pooled broker client");
        return;
    }
    if let Some(entry) = clients.remove(&key) {
        if let Err(err) = entry.client.flush().await {
            warn!(%err, "flush on final broker release failed");
        }
        info!(key, "closed pooled broker connection");
    }
}

async fn connect_with_retry(config: &BrokerConfig) -> Result<async_nats::Client, Error> {
    let addrs = config.servers.join(",");
    let mut attempt: i32 = 0;
    loop {
        attempt += 1;
        match async_nats::connect(addrs.as_str()).await {
            Ok(client) => {
                info!(servers = %addrs, attempt, "connected to broker");
                return Ok(client);
            }
            Err(err) => {
                let exhausted =
                    config.max_connect_attempts >= 0 && attempt >= config.max_connect_attempts;
                if exhausted {
                    return Err(Error::Connect(format!(
                        "unable to reach broker at {addrs} after {attempt} attempt(s): {err}"
                    )));
                }
                warn!(servers = %addrs, attempt, %err, "broker connect failed; retrying");
                tokio::time::sleep(config.connect_time_wait()).await;
            }
        }
    }
}
