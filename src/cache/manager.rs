//! Query cache facade owning the single active cache client

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::{Arc, OnceLock};

use super::client::CacheClient;
use super::config::CacheOptions;
use super::entry::Ttl;
use super::error::CacheError;
use super::store::{connector_for, Connector};

/// The ORM side of the cache.
///
/// Cached results come back as plain JSON; the host must be able to rebuild
/// model instances from them before caching can be enabled.
pub trait QueryHost: Send + Sync {
  /// Whether plain cached values can be hydrated into model instances
  fn can_hydrate(&self) -> bool;
}

/// Entry point binding one [`CacheClient`] to the host's query layer.
///
/// Every operation is a harmless no-op returning `false` until
/// [`QueryCache::initialize`] has installed a client.
pub struct QueryCache {
  active: RwLock<Option<CacheClient>>,
  init_lock: tokio::sync::Mutex<()>,
  connector: Mutex<Option<Arc<dyn Connector>>>,
}

impl QueryCache {
  pub fn new() -> Self {
    Self {
      active: RwLock::new(None),
      init_lock: tokio::sync::Mutex::new(()),
      connector: Mutex::new(None),
    }
  }

  /// Facade whose clients connect through `connector`
  pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
    let cache = Self::new();
    *cache.connector.lock() = Some(connector);
    cache
  }

  /// Process-wide instance
  pub fn global() -> &'static QueryCache {
    static GLOBAL: OnceLock<QueryCache> = OnceLock::new();
    GLOBAL.get_or_init(QueryCache::new)
  }

  /// Install a cache client for `options`.
  ///
  /// Fails if `host` cannot hydrate cached documents. Re-entry with the same
  /// serverless setting is a no-op; a different setting closes the active
  /// client and installs a new one. Outside serverless mode the new client
  /// starts connecting in the background.
  pub async fn initialize<H: QueryHost + ?Sized>(
    &self,
    host: &H,
    options: CacheOptions,
  ) -> Result<(), CacheError> {
    if !host.can_hydrate() {
      return Err(CacheError::Configuration(
        "query host cannot hydrate cached documents into model instances".to_string(),
      ));
    }

    let _guard = self.init_lock.lock().await;

    if let Some(current) = self.client() {
      if current.is_serverless() == options.serverless_mode {
        return Ok(());
      }

      tracing::info!(
        "Reinitializing query cache (serverless: {} -> {})",
        current.is_serverless(),
        options.serverless_mode
      );
      if let Err(e) = current.close().await {
        tracing::debug!("Ignoring close error during reinitialization: {}", e);
      }
      self.active.write().take();
    }

    let connector = self.connector_for(&options)?;
    let client = CacheClient::new(options, connector);

    if !client.is_serverless() {
      let eager = client.clone();
      tokio::spawn(async move {
        if !eager.connect().await {
          tracing::warn!(
            "Query cache could not connect on startup: {}",
            eager.last_error().unwrap_or_default()
          );
        }
      });
    }

    tracing::info!(
      "Query cache initialized ({} backend, prefix {:?}, serverless: {})",
      client.options().backend,
      client.prefix(),
      client.is_serverless()
    );
    *self.active.write() = Some(client);
    Ok(())
  }

  /// The active client, if initialized
  pub fn client(&self) -> Option<CacheClient> {
    self.active.read().clone()
  }

  /// Without a key, clear the whole namespace; with one, delete that entry
  pub async fn clear_cache(&self, key: Option<&str>) -> Result<bool, CacheError> {
    let Some(client) = self.client() else {
      return Ok(false);
    };
    match key {
      Some(key) if !key.is_empty() => client.del(key).await,
      _ => client.clear().await,
    }
  }

  /// Store a value directly; `None` ttl means no expiry
  pub async fn set_cache<V: Serialize + ?Sized>(
    &self,
    key: &str,
    value: &V,
    ttl: Option<Ttl>,
  ) -> Result<bool, CacheError> {
    let Some(client) = self.client() else {
      return Ok(false);
    };
    client.set(key, value, ttl.unwrap_or(Ttl::Forever)).await
  }

  pub async fn connect(&self) -> bool {
    match self.client() {
      Some(client) => client.connect().await,
      None => false,
    }
  }

  pub async fn disconnect(&self) -> Result<bool, CacheError> {
    match self.client() {
      Some(client) => client.close().await,
      None => Ok(false),
    }
  }

  pub fn is_connected(&self) -> bool {
    self
      .client()
      .map(|client| client.is_connected())
      .unwrap_or(false)
  }

  /// Reuse the connector across reinitializations so an in-process store
  /// keeps its entries when the client is swapped.
  fn connector_for(&self, options: &CacheOptions) -> Result<Arc<dyn Connector>, CacheError> {
    let mut slot = self.connector.lock();
    if let Some(connector) = slot.as_ref() {
      if connector.backend() == options.backend {
        return Ok(connector.clone());
      }
    }
    let connector = connector_for(options.backend)?;
    *slot = Some(connector.clone());
    Ok(connector)
  }
}

impl Default for QueryCache {
  fn default() -> Self {
    Self::new()
  }
}
