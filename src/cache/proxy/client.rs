//! Redis proxy client for connecting to external Redis servers

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, RedisError, RedisResult};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::config::{Backend, CacheOptions, ReconnectOnError, RetryStrategy};
use crate::cache::error::CacheError;
use crate::cache::events::{ConnectionEvent, ConnectionTracker};
use crate::cache::store::{Connector, StoreConnection};

/// Upper bound for the connection manager's reconnect backoff, in ms
const MAX_RECONNECT_DELAY_MS: u64 = 1000;

/// Opens [`RedisProxyClient`] connections
pub struct RedisConnector;

#[async_trait]
impl Connector for RedisConnector {
  fn backend(&self) -> Backend {
    Backend::Redis
  }

  async fn connect(
    &self,
    options: &CacheOptions,
    events: Arc<ConnectionTracker>,
  ) -> Result<Arc<dyn StoreConnection>, CacheError> {
    let client = RedisProxyClient::new(options, events).await?;
    Ok(Arc::new(client))
  }
}

/// Redis connection with per-request retry on reconnectable errors
pub struct RedisProxyClient {
  connection: ConnectionManager,
  ready: AtomicBool,
  events: Arc<ConnectionTracker>,
  retry: RetryPolicy,
}

/// Per-request retry budget, backoff and retryable-error predicate
struct RetryPolicy {
  max_retries: u32,
  strategy: RetryStrategy,
  reconnect_on_error: ReconnectOnError,
}

impl RetryPolicy {
  fn from_options(options: &CacheOptions) -> Self {
    Self {
      max_retries: options.max_retries_per_request,
      strategy: options.retry_strategy.clone(),
      reconnect_on_error: options.reconnect_on_error.clone(),
    }
  }

  /// Run `command` until it succeeds, the budget is spent, the error is not
  /// retryable, or the strategy gives up. `on_error` sees every failure.
  async fn run<T, F, Fut, E>(
    &self,
    op: &'static str,
    mut command: F,
    mut on_error: E,
  ) -> Result<T, CacheError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = RedisResult<T>>,
    E: FnMut(&RedisError),
  {
    let mut attempt = 0u32;
    loop {
      let e = match command().await {
        Ok(value) => return Ok(value),
        Err(e) => e,
      };
      on_error(&e);

      let message = e.to_string();
      attempt += 1;
      if attempt > self.max_retries || !self.reconnect_on_error.matches(&message) {
        return Err(CacheError::transport(op, message));
      }
      let Some(delay) = self.strategy.delay(attempt) else {
        return Err(CacheError::transport(op, message));
      };
      tracing::debug!(
        "Redis {} failed ({}), retry {} in {:?}",
        op,
        message,
        attempt,
        delay
      );
      tokio::time::sleep(delay).await;
    }
  }
}

impl RedisProxyClient {
  /// Connect using the given options
  pub async fn new(
    options: &CacheOptions,
    events: Arc<ConnectionTracker>,
  ) -> Result<Self, CacheError> {
    let client = Client::open(options.connection_url())
      .map_err(|e| CacheError::Configuration(format!("invalid Redis address: {}", e)))?;

    let config = ConnectionManagerConfig::new()
      .set_number_of_retries(options.max_retries_per_request as usize)
      .set_max_delay(MAX_RECONNECT_DELAY_MS)
      .set_connection_timeout(options.connect_timeout_duration());

    let connection = ConnectionManager::new_with_config(client, config)
      .await
      .map_err(|e| CacheError::Connection(e.to_string()))?;
    events.emit(ConnectionEvent::Connect);

    Ok(Self {
      connection,
      ready: AtomicBool::new(true),
      events,
      retry: RetryPolicy::from_options(options),
    })
  }

  /// Run a command under the retry policy, tracking socket drops and recovery
  async fn run<T, F, Fut>(&self, op: &'static str, command: F) -> Result<T, CacheError>
  where
    F: Fn(ConnectionManager) -> Fut,
    Fut: Future<Output = RedisResult<T>>,
  {
    let result = self
      .retry
      .run(op, || command(self.connection.clone()), |e| {
        if drops_connection(e) && self.ready.swap(false, Ordering::SeqCst) {
          self.events.emit(ConnectionEvent::Error(e.to_string()));
          self.events.emit(ConnectionEvent::End);
        }
      })
      .await;
    if result.is_ok() && !self.ready.swap(true, Ordering::SeqCst) {
      self.events.emit(ConnectionEvent::Ready);
    }
    result
  }
}

fn drops_connection(e: &RedisError) -> bool {
  e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

#[async_trait]
impl StoreConnection for RedisProxyClient {
  fn is_ready(&self) -> bool {
    self.ready.load(Ordering::SeqCst)
  }

  async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
    self
      .run("GET", |mut conn| async move {
        conn.get::<_, Option<String>>(key).await
      })
      .await
  }

  async fn set(
    &self,
    key: &str,
    value: String,
    expiry_secs: Option<u64>,
  ) -> Result<(), CacheError> {
    let value = &value;
    match expiry_secs {
      Some(secs) => {
        self
          .run("SET", |mut conn| async move {
            conn.set_ex::<_, _, ()>(key, value, secs).await
          })
          .await
      }
      None => {
        self
          .run("SET", |mut conn| async move {
            conn.set::<_, _, ()>(key, value).await
          })
          .await
      }
    }
  }

  async fn del(&self, keys: &[String]) -> Result<usize, CacheError> {
    if keys.is_empty() {
      return Ok(0);
    }
    self
      .run("DEL", |mut conn| async move {
        conn.del::<_, usize>(keys).await
      })
      .await
  }

  async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
    self
      .run("KEYS", |mut conn| async move {
        conn.keys::<_, Vec<String>>(pattern).await
      })
      .await
  }

  async fn ping(&self) -> Result<(), CacheError> {
    self
      .run("PING", |mut conn| async move {
        redis::cmd("PING").query_async::<()>(&mut conn).await
      })
      .await
  }

  async fn quit(&self) -> Result<(), CacheError> {
    self.ready.store(false, Ordering::SeqCst);
    let mut conn = self.connection.clone();
    // The server closes the socket right after replying
    match redis::cmd("QUIT").query_async::<()>(&mut conn).await {
      Ok(()) => Ok(()),
      Err(e) if drops_connection(&e) => Ok(()),
      Err(e) => Err(CacheError::transport("QUIT", e.to_string())),
    }
  }
}
