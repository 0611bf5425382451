//! Namespaced JSON cache client with a lazy connection lifecycle

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::config::CacheOptions;
use super::entry::Ttl;
use super::error::CacheError;
use super::events::{ConnectionEvent, ConnectionStatus, ConnectionTracker, RecordedError};
use super::store::{connector_for, escape_glob, Connector, StoreConnection};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

type PendingConnect = Shared<BoxFuture<'static, bool>>;

/// Cache client over one logical store connection.
///
/// Cloning is cheap and every clone shares the same connection. Keys are
/// namespaced with the configured prefix and values are stored as JSON text.
/// The connection is opened on demand: any operation on a disconnected client
/// connects first, and concurrent callers share a single attempt.
#[derive(Clone)]
pub struct CacheClient {
  inner: Arc<ClientInner>,
}

struct ClientInner {
  id: u64,
  options: CacheOptions,
  connector: Arc<dyn Connector>,
  connection: RwLock<Option<Arc<dyn StoreConnection>>>,
  tracker: Arc<ConnectionTracker>,
  /// In-flight connect attempt, tagged with its sequence number
  pending: Mutex<Option<(u64, PendingConnect)>>,
  attempts: AtomicU64,
  /// Bumped by `close`; attempts started under an older epoch are discarded
  epoch: AtomicU64,
  heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl CacheClient {
  pub fn new(options: CacheOptions, connector: Arc<dyn Connector>) -> Self {
    Self {
      inner: Arc::new(ClientInner {
        id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
        options,
        connector,
        connection: RwLock::new(None),
        tracker: Arc::new(ConnectionTracker::new()),
        pending: Mutex::new(None),
        attempts: AtomicU64::new(0),
        epoch: AtomicU64::new(0),
        heartbeat: Mutex::new(None),
      }),
    }
  }

  /// Build a client for the backend named in `options`
  pub fn from_options(options: CacheOptions) -> Result<Self, CacheError> {
    let connector = connector_for(options.backend)?;
    Ok(Self::new(options, connector))
  }

  /// Process-unique identifier of this client instance
  pub fn id(&self) -> u64 {
    self.inner.id
  }

  pub fn options(&self) -> &CacheOptions {
    &self.inner.options
  }

  pub fn prefix(&self) -> &str {
    &self.inner.options.prefix
  }

  pub fn is_serverless(&self) -> bool {
    self.inner.options.serverless_mode
  }

  pub fn status(&self) -> ConnectionStatus {
    self.inner.tracker.status()
  }

  /// Most recent connection-level error
  pub fn last_error(&self) -> Option<String> {
    self.inner.tracker.last_error()
  }

  /// Recent connection-level errors, most recent first
  pub fn recent_errors(&self) -> Vec<RecordedError> {
    self.inner.tracker.recent_errors()
  }

  /// Subscribe to connection events
  pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
    self.inner.tracker.subscribe()
  }

  /// Connected state AND a connection that reports ready
  pub fn is_connected(&self) -> bool {
    self.inner.is_connected()
  }

  /// Connect if not connected. Joins an attempt already in flight.
  ///
  /// Connection failures are recorded, not returned: the result only says
  /// whether the client ended up connected.
  pub async fn connect(&self) -> bool {
    if self.is_connected() {
      return true;
    }

    let attempt = {
      let mut pending = self.inner.pending.lock();
      match pending.as_ref() {
        Some((_, attempt)) => attempt.clone(),
        None => {
          let seq = self.inner.attempts.fetch_add(1, Ordering::SeqCst);
          let inner = self.inner.clone();
          let attempt = async move { inner.attempt_connect(seq).await }
            .boxed()
            .shared();
          *pending = Some((seq, attempt.clone()));
          attempt
        }
      }
    };

    attempt.await
  }

  /// Close the connection and reset to "no connection". Safe to call when
  /// already closed; an attempt still in flight is discarded when it lands.
  pub async fn close(&self) -> Result<bool, CacheError> {
    let connection = {
      let mut slot = self.inner.connection.write();
      self.inner.epoch.fetch_add(1, Ordering::SeqCst);
      slot.take()
    };
    self.inner.pending.lock().take();
    if let Some(heartbeat) = self.inner.heartbeat.lock().take() {
      heartbeat.abort();
    }

    let result = match connection {
      Some(connection) => connection.quit().await,
      None => Ok(()),
    };
    if self.inner.tracker.status() != ConnectionStatus::Disconnected {
      self.inner.tracker.emit(ConnectionEvent::End);
    }
    result.map(|_| true)
  }

  /// Fetch and decode `prefix + key`. A miss is `Ok(None)`.
  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
    let connection = self.ensure_connected("GET").await?;
    match connection.get(&self.key(key)).await? {
      Some(text) => Ok(Some(serde_json::from_str(&text)?)),
      None => Ok(None),
    }
  }

  /// Encode and store `value` under `prefix + key`
  pub async fn set<V: Serialize + ?Sized>(
    &self,
    key: &str,
    value: &V,
    ttl: impl Into<Ttl>,
  ) -> Result<bool, CacheError> {
    let serialized = serde_json::to_string(value)?;
    let expiry = ttl.into().resolve(self.inner.options.default_ttl_secs());
    let connection = self.ensure_connected("SET").await?;
    connection.set(&self.key(key), serialized, expiry).await?;
    Ok(true)
  }

  /// Delete `prefix + key`; a missing key is not an error
  pub async fn del(&self, key: &str) -> Result<bool, CacheError> {
    let connection = self.ensure_connected("DEL").await?;
    connection.del(&[self.key(key)]).await?;
    Ok(true)
  }

  /// Delete every key under the prefix in one batch
  pub async fn clear(&self) -> Result<bool, CacheError> {
    let connection = self.ensure_connected("KEYS").await?;
    let pattern = format!("{}*", escape_glob(self.prefix()));
    let keys = connection.keys(&pattern).await?;
    if keys.is_empty() {
      return Ok(true);
    }
    let removed = connection.del(&keys).await?;
    tracing::debug!("Cleared {} cache keys under {}", removed, self.prefix());
    Ok(true)
  }

  /// Serve `key` from the cache, or run `loader` and cache its result.
  ///
  /// Cache faults never fail the call: they are logged and the loader runs.
  pub async fn get_or_load<T, E, F, Fut>(
    &self,
    key: &str,
    ttl: impl Into<Ttl>,
    loader: F,
  ) -> Result<T, E>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    let ttl = ttl.into();
    match self.get::<T>(key).await {
      Ok(Some(cached)) => return Ok(cached),
      Ok(None) => {}
      Err(e) => tracing::warn!("Cache read for {} failed, loading from source: {}", key, e),
    }

    let value = loader().await?;
    if let Err(e) = self.set(key, &value, ttl).await {
      tracing::warn!("Cache write for {} failed: {}", key, e);
    }
    Ok(value)
  }

  fn key(&self, key: &str) -> String {
    format!("{}{}", self.inner.options.prefix, key)
  }

  async fn ensure_connected(
    &self,
    op: &'static str,
  ) -> Result<Arc<dyn StoreConnection>, CacheError> {
    if !self.is_connected() {
      if !self.inner.options.enable_offline_queue && self.inner.pending.lock().is_some() {
        return Err(CacheError::Connection(format!(
          "{} rejected: connection in progress and offline queue is disabled",
          op
        )));
      }
      if !self.connect().await {
        let reason = self
          .last_error()
          .unwrap_or_else(|| "not connected".to_string());
        return Err(CacheError::Connection(reason));
      }
    }
    self
      .inner
      .current()
      .ok_or_else(|| CacheError::Connection("connection closed".to_string()))
  }
}

impl ClientInner {
  fn current(&self) -> Option<Arc<dyn StoreConnection>> {
    self.connection.read().clone()
  }

  fn is_connected(&self) -> bool {
    self.tracker.status() == ConnectionStatus::Connected
      && self
        .current()
        .map(|connection| connection.is_ready())
        .unwrap_or(false)
  }

  async fn attempt_connect(self: Arc<Self>, seq: u64) -> bool {
    let connected = if self.is_connected() {
      true
    } else {
      self.open_connection().await
    };

    let mut pending = self.pending.lock();
    if matches!(pending.as_ref(), Some((current, _)) if *current == seq) {
      pending.take();
    }
    connected
  }

  async fn open_connection(self: &Arc<Self>) -> bool {
    let epoch = self.epoch.load(Ordering::SeqCst);
    self.tracker.emit(ConnectionEvent::Connecting);

    let opening = self.connector.connect(&self.options, self.tracker.clone());
    let outcome = if self.options.serverless_mode {
      tokio::time::timeout(self.options.connect_timeout_duration(), opening)
        .await
        .ok()
    } else {
      Some(opening.await)
    };

    match outcome {
      Some(Ok(connection)) => self.install(connection, epoch).await,
      Some(Err(e)) => {
        self.discard(epoch);
        self.tracker.emit(ConnectionEvent::Error(e.to_string()));
        false
      }
      None => {
        self.tracker.emit(ConnectionEvent::Error(format!(
          "connect timed out after {}ms",
          self.options.connect_timeout
        )));
        if self.discard(epoch) {
          self.tracker.emit(ConnectionEvent::End);
        }
        false
      }
    }
  }

  async fn install(self: &Arc<Self>, connection: Arc<dyn StoreConnection>, epoch: u64) -> bool {
    let replaced = {
      let mut slot = self.connection.write();
      if self.epoch.load(Ordering::SeqCst) != epoch {
        None
      } else {
        Some(slot.replace(connection.clone()))
      }
    };

    let Some(previous) = replaced else {
      tracing::debug!("Cache client {} closed while connecting", self.id);
      let _ = connection.quit().await;
      return false;
    };
    if let Some(previous) = previous {
      let _ = previous.quit().await;
    }

    self.tracker.emit(ConnectionEvent::Ready);
    self.start_heartbeat(epoch);
    true
  }

  /// Drop the connection handle unless the client was closed since `epoch`
  fn discard(&self, epoch: u64) -> bool {
    let mut slot = self.connection.write();
    if self.epoch.load(Ordering::SeqCst) != epoch {
      return false;
    }
    slot.take();
    true
  }

  fn start_heartbeat(self: &Arc<Self>, epoch: u64) {
    let Some(interval) = self.options.keep_alive_interval() else {
      return;
    };

    let weak: Weak<ClientInner> = Arc::downgrade(self);
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        if inner.epoch.load(Ordering::SeqCst) != epoch {
          break;
        }
        let Some(connection) = inner.current() else {
          break;
        };
        if let Err(e) = connection.ping().await {
          tracing::warn!("Cache heartbeat failed: {}", e);
          break;
        }
      }
    });

    if let Some(previous) = self.heartbeat.lock().replace(handle) {
      previous.abort();
    }
  }
}

impl Drop for ClientInner {
  fn drop(&mut self) {
    if let Some(heartbeat) = self.heartbeat.get_mut().take() {
      heartbeat.abort();
    }
  }
}

impl std::fmt::Debug for CacheClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheClient")
      .field("id", &self.inner.id)
      .field("backend", &self.inner.options.backend)
      .field("prefix", &self.inner.options.prefix)
      .field("serverless", &self.inner.options.serverless_mode)
      .field("status", &self.inner.tracker.status())
      .finish()
  }
}
