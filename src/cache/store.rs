//! Store backends: the transport seam under the cache client

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::config::{Backend, CacheOptions};
use super::entry::StoredValue;
use super::error::CacheError;
use super::events::{ConnectionEvent, ConnectionTracker};

/// Opens connections to a backing store
#[async_trait]
pub trait Connector: Send + Sync {
  fn backend(&self) -> Backend;

  /// Open a new connection. The transport reports `Connect` once its socket
  /// is open and later `Error`/`End` on the tracker.
  async fn connect(
    &self,
    options: &CacheOptions,
    events: Arc<ConnectionTracker>,
  ) -> Result<Arc<dyn StoreConnection>, CacheError>;
}

/// One open connection to a backing store. Keys are passed fully namespaced.
#[async_trait]
pub trait StoreConnection: Send + Sync {
  /// Whether the underlying connection currently accepts commands
  fn is_ready(&self) -> bool;
  async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
  async fn set(&self, key: &str, value: String, expiry_secs: Option<u64>)
    -> Result<(), CacheError>;
  async fn del(&self, keys: &[String]) -> Result<usize, CacheError>;
  async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;
  async fn ping(&self) -> Result<(), CacheError>;
  async fn quit(&self) -> Result<(), CacheError>;
}

/// Build the connector for a configured backend
pub fn connector_for(backend: Backend) -> Result<Arc<dyn Connector>, CacheError> {
  match backend {
    Backend::Memory => Ok(Arc::new(MemoryConnector::new(Arc::new(
      InMemoryStore::new(),
    )))),
    #[cfg(feature = "redis")]
    Backend::Redis => Ok(Arc::new(super::proxy::RedisConnector)),
    #[cfg(not(feature = "redis"))]
    Backend::Redis => Err(CacheError::Configuration(
      "the redis backend requires the `redis` feature".to_string(),
    )),
  }
}

/// Escape glob metacharacters so a literal prefix can be used in a pattern
pub fn escape_glob(literal: &str) -> String {
  let mut escaped = String::with_capacity(literal.len());
  for c in literal.chars() {
    if matches!(c, '*' | '?' | '[' | ']' | '\\') {
      escaped.push('\\');
    }
    escaped.push(c);
  }
  escaped
}

/// In-process key-value store with TTL expiry and glob key listing
pub struct InMemoryStore {
  data: RwLock<HashMap<String, StoredValue>>,
  /// Bumped to sever every open connection
  generation: AtomicU64,
  connects: AtomicU64,
  available: AtomicBool,
  connect_delay: RwLock<Option<Duration>>,
  expired: AtomicU64,
}

impl InMemoryStore {
  pub fn new() -> Self {
    Self {
      data: RwLock::new(HashMap::new()),
      generation: AtomicU64::new(0),
      connects: AtomicU64::new(0),
      available: AtomicBool::new(true),
      connect_delay: RwLock::new(None),
      expired: AtomicU64::new(0),
    }
  }

  /// Number of connections opened so far
  pub fn connect_count(&self) -> u64 {
    self.connects.load(Ordering::SeqCst)
  }

  /// Refuse (or accept again) new connections
  pub fn set_available(&self, available: bool) {
    self.available.store(available, Ordering::SeqCst);
  }

  /// Delay every connection handshake
  pub fn set_connect_delay(&self, delay: Option<Duration>) {
    *self.connect_delay.write() = delay;
  }

  /// Sever every open connection, as a server restart would
  pub fn drop_connections(&self) {
    self.generation.fetch_add(1, Ordering::SeqCst);
  }

  /// Raw stored text for a fully namespaced key
  pub fn raw_get(&self, key: &str) -> Option<String> {
    let data = self.data.read();
    data
      .get(key)
      .filter(|e| !e.is_expired())
      .map(|e| e.value.clone())
  }

  /// Store raw text under a fully namespaced key, bypassing serialization
  pub fn raw_set(&self, key: &str, value: &str, expiry_secs: Option<u64>) {
    let mut data = self.data.write();
    data.insert(
      key.to_string(),
      StoredValue::new(value.to_string(), expiry_secs),
    );
  }

  /// Redis TTL semantics: -2 missing, -1 no expiry, else seconds remaining
  pub fn ttl(&self, key: &str) -> i64 {
    let data = self.data.read();
    match data.get(key) {
      Some(entry) if !entry.is_expired() => entry
        .ttl_remaining()
        .map(|d| d.as_secs_f64().round() as i64)
        .unwrap_or(-1),
      _ => -2,
    }
  }

  /// Number of live keys
  pub fn dbsize(&self) -> usize {
    let data = self.data.read();
    data.values().filter(|e| !e.is_expired()).count()
  }

  /// Expired entries removed on read
  pub fn expired_count(&self) -> u64 {
    self.expired.load(Ordering::Relaxed)
  }

  fn generation(&self) -> u64 {
    self.generation.load(Ordering::SeqCst)
  }

  fn get(&self, key: &str) -> Option<String> {
    let mut data = self.data.write();
    match data.get(key) {
      Some(entry) if entry.is_expired() => {
        data.remove(key);
        self.expired.fetch_add(1, Ordering::Relaxed);
        None
      }
      Some(entry) => Some(entry.value.clone()),
      None => None,
    }
  }

  fn set(&self, key: &str, value: String, expiry_secs: Option<u64>) {
    let mut data = self.data.write();
    data.insert(key.to_string(), StoredValue::new(value, expiry_secs));
  }

  fn delete(&self, keys: &[String]) -> usize {
    let mut data = self.data.write();
    keys
      .iter()
      .filter_map(|k| data.remove(k))
      .filter(|e| !e.is_expired())
      .count()
  }

  fn keys(&self, pattern: &str) -> Vec<String> {
    let data = self.data.read();

    if pattern == "*" {
      return data
        .iter()
        .filter(|(_, e)| !e.is_expired())
        .map(|(k, _)| k.clone())
        .collect();
    }

    let regex = glob_to_regex(pattern);
    data
      .iter()
      .filter(|(k, e)| !e.is_expired() && regex.is_match(k))
      .map(|(k, _)| k.clone())
      .collect()
  }
}

impl Default for InMemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

/// Connector over a shared [`InMemoryStore`]
pub struct MemoryConnector {
  store: Arc<InMemoryStore>,
}

impl MemoryConnector {
  pub fn new(store: Arc<InMemoryStore>) -> Self {
    Self { store }
  }

  pub fn store(&self) -> &Arc<InMemoryStore> {
    &self.store
  }
}

#[async_trait]
impl Connector for MemoryConnector {
  fn backend(&self) -> Backend {
    Backend::Memory
  }

  async fn connect(
    &self,
    _options: &CacheOptions,
    events: Arc<ConnectionTracker>,
  ) -> Result<Arc<dyn StoreConnection>, CacheError> {
    let delay = *self.store.connect_delay.read();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if !self.store.available.load(Ordering::SeqCst) {
      return Err(CacheError::Connection(
        "connect ECONNREFUSED: memory store is unavailable".to_string(),
      ));
    }

    self.store.connects.fetch_add(1, Ordering::SeqCst);
    events.emit(ConnectionEvent::Connect);
    Ok(Arc::new(MemoryConnection {
      store: self.store.clone(),
      generation: self.store.generation(),
      open: AtomicBool::new(true),
      events,
    }))
  }
}

struct MemoryConnection {
  store: Arc<InMemoryStore>,
  generation: u64,
  open: AtomicBool,
  events: Arc<ConnectionTracker>,
}

impl MemoryConnection {
  fn check(&self, op: &'static str) -> Result<(), CacheError> {
    if !self.open.load(Ordering::SeqCst) {
      return Err(CacheError::transport(op, "connection is closed"));
    }
    if self.store.generation() != self.generation {
      self.open.store(false, Ordering::SeqCst);
      let message = "read ECONNRESET: connection reset by store".to_string();
      self.events.emit(ConnectionEvent::Error(message.clone()));
      self.events.emit(ConnectionEvent::End);
      return Err(CacheError::transport(op, message));
    }
    Ok(())
  }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
  fn is_ready(&self) -> bool {
    self.open.load(Ordering::SeqCst) && self.store.generation() == self.generation
  }

  async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
    self.check("GET")?;
    Ok(self.store.get(key))
  }

  async fn set(
    &self,
    key: &str,
    value: String,
    expiry_secs: Option<u64>,
  ) -> Result<(), CacheError> {
    self.check("SET")?;
    self.store.set(key, value, expiry_secs);
    Ok(())
  }

  async fn del(&self, keys: &[String]) -> Result<usize, CacheError> {
    self.check("DEL")?;
    Ok(self.store.delete(keys))
  }

  async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
    self.check("KEYS")?;
    Ok(self.store.keys(pattern))
  }

  async fn ping(&self) -> Result<(), CacheError> {
    self.check("PING")
  }

  async fn quit(&self) -> Result<(), CacheError> {
    self.open.store(false, Ordering::SeqCst);
    Ok(())
  }
}

/// Convert a glob pattern to a regex. `\x` matches `x` literally.
fn glob_to_regex(pattern: &str) -> regex::Regex {
  let mut regex_str = String::with_capacity(pattern.len() * 2);
  regex_str.push('^');

  let mut chars = pattern.chars();
  while let Some(c) = chars.next() {
    match c {
      '*' => regex_str.push_str(".*"),
      '?' => regex_str.push('.'),
      '\\' => {
        if let Some(next) = chars.next() {
          regex_str.push_str(&regex::escape(&next.to_string()));
        }
      }
      _ => regex_str.push_str(&regex::escape(&c.to_string())),
    }
  }

  regex_str.push('$');
  regex::Regex::new(&regex_str).unwrap_or_else(|_| regex::Regex::new("^$").unwrap())
}
