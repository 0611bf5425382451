//! Query cache facade tests

use querycache::{
  CacheError, CacheOptions, InMemoryStore, MemoryConnector, QueryCache, QueryHost, Ttl,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

struct Host {
  hydrates: bool,
}

impl QueryHost for Host {
  fn can_hydrate(&self) -> bool {
    self.hydrates
  }
}

const HOST: Host = Host { hydrates: true };

fn memory_cache() -> (QueryCache, Arc<InMemoryStore>) {
  let store = Arc::new(InMemoryStore::new());
  let cache = QueryCache::with_connector(Arc::new(MemoryConnector::new(store.clone())));
  (cache, store)
}

async fn wait_until_connected(cache: &QueryCache) -> bool {
  for _ in 0..100 {
    if cache.is_connected() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  false
}

// =============================================================================
// Before Initialization
// =============================================================================

#[tokio::test]
async fn test_uninitialized_operations_are_noops() {
  let (cache, store) = memory_cache();

  assert!(cache.client().is_none());
  assert!(!cache.is_connected());
  assert!(!cache.connect().await);
  assert!(!cache.disconnect().await.unwrap());
  assert!(!cache.clear_cache(None).await.unwrap());
  assert!(!cache.clear_cache(Some("k")).await.unwrap());
  assert!(!cache.set_cache("k", &1, None).await.unwrap());
  assert_eq!(store.connect_count(), 0);
}

#[tokio::test]
async fn test_host_without_hydration_is_rejected() {
  let (cache, _) = memory_cache();
  let result = cache
    .initialize(&Host { hydrates: false }, CacheOptions::memory())
    .await;

  assert!(matches!(result, Err(CacheError::Configuration(_))));
  assert!(cache.client().is_none());
}

// =============================================================================
// Initialization
// =============================================================================

#[tokio::test]
async fn test_initialize_connects_eagerly() {
  let (cache, store) = memory_cache();
  cache.initialize(&HOST, CacheOptions::memory()).await.unwrap();

  assert!(wait_until_connected(&cache).await);
  assert_eq!(store.connect_count(), 1);
}

#[tokio::test]
async fn test_serverless_initialize_is_lazy() {
  let (cache, store) = memory_cache();
  cache
    .initialize(&HOST, CacheOptions::memory().with_serverless_mode(true))
    .await
    .unwrap();

  tokio::time::sleep(Duration::from_millis(20)).await;
  assert!(!cache.is_connected());
  assert_eq!(store.connect_count(), 0);

  assert!(cache.set_cache("k", &1, None).await.unwrap());
  assert!(cache.is_connected());
  assert_eq!(store.connect_count(), 1);
}

#[tokio::test]
async fn test_reinitialize_same_mode_keeps_client() {
  let (cache, store) = memory_cache();
  cache.initialize(&HOST, CacheOptions::memory()).await.unwrap();
  let first = cache.client().unwrap().id();
  assert!(wait_until_connected(&cache).await);

  cache
    .initialize(&HOST, CacheOptions::memory().with_prefix("ignored:"))
    .await
    .unwrap();

  let current = cache.client().unwrap();
  assert_eq!(current.id(), first);
  assert_eq!(current.prefix(), "cachegoose:");
  assert_eq!(store.connect_count(), 1);
}

#[tokio::test]
async fn test_reinitialize_other_mode_swaps_client() {
  let (cache, store) = memory_cache();
  cache.initialize(&HOST, CacheOptions::memory()).await.unwrap();
  let old = cache.client().unwrap();
  assert!(wait_until_connected(&cache).await);
  cache.set_cache("kept", &json!({"a": 1}), None).await.unwrap();

  cache
    .initialize(&HOST, CacheOptions::memory().with_serverless_mode(true))
    .await
    .unwrap();

  let new = cache.client().unwrap();
  assert_ne!(new.id(), old.id());
  assert!(new.is_serverless());
  assert!(!old.is_connected());

  // Same store behind the new client
  assert_eq!(
    new.get::<Value>("kept").await.unwrap(),
    Some(json!({"a": 1}))
  );
  assert_eq!(store.connect_count(), 2);
}

// =============================================================================
// Operations
// =============================================================================

#[tokio::test]
async fn test_clear_cache_by_key_and_namespace() {
  let (cache, store) = memory_cache();
  cache.initialize(&HOST, CacheOptions::memory()).await.unwrap();
  cache.set_cache("a", &1, None).await.unwrap();
  cache.set_cache("b", &2, None).await.unwrap();
  cache.set_cache("c", &3, None).await.unwrap();

  assert!(cache.clear_cache(Some("a")).await.unwrap());
  assert_eq!(store.dbsize(), 2);

  // An empty key clears the namespace
  assert!(cache.clear_cache(Some("")).await.unwrap());
  assert_eq!(store.dbsize(), 0);

  cache.set_cache("d", &4, None).await.unwrap();
  assert!(cache.clear_cache(None).await.unwrap());
  assert_eq!(store.dbsize(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_set_cache_ttl() {
  let (cache, store) = memory_cache();
  cache.initialize(&HOST, CacheOptions::memory()).await.unwrap();

  cache.set_cache("forever", &1, None).await.unwrap();
  cache.set_cache("short", &1, Some(Ttl::Seconds(5))).await.unwrap();
  cache.set_cache("default", &1, Some(Ttl::Default)).await.unwrap();

  assert_eq!(store.ttl("cachegoose:forever"), -1);
  assert_eq!(store.ttl("cachegoose:short"), 5);
  assert_eq!(store.ttl("cachegoose:default"), 60);
}

#[tokio::test]
async fn test_disconnect_then_connect() {
  let (cache, store) = memory_cache();
  cache.initialize(&HOST, CacheOptions::memory()).await.unwrap();
  assert!(wait_until_connected(&cache).await);

  assert!(cache.disconnect().await.unwrap());
  assert!(!cache.is_connected());

  assert!(cache.connect().await);
  assert!(cache.is_connected());
  assert_eq!(store.connect_count(), 2);
}

#[tokio::test]
async fn test_unreachable_store_does_not_fail_initialize() {
  let (cache, store) = memory_cache();
  store.set_available(false);

  cache.initialize(&HOST, CacheOptions::memory()).await.unwrap();
  assert!(!cache.connect().await);
  assert!(cache.set_cache("k", &1, None).await.is_err());

  store.set_available(true);
  assert!(cache.connect().await);
}

#[test]
fn test_global_is_shared() {
  let a = QueryCache::global() as *const QueryCache;
  let b = QueryCache::global() as *const QueryCache;
  assert_eq!(a, b);
}
