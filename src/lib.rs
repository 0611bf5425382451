//! querycache - cache ORM query results in Redis
//!
//! The ORM's query hook computes a key for a cacheable query and calls
//! [`CacheClient::get`] / [`CacheClient::set`] (or
//! [`CacheClient::get_or_load`]); this crate moves the JSON payload in and out
//! of the store and owns the connection lifecycle.
//!
//! # Example
//!
//! ```ignore
//! use querycache::{CacheOptions, QueryCache, QueryHost, Ttl};
//!
//! struct Orm;
//! impl QueryHost for Orm {
//!   fn can_hydrate(&self) -> bool {
//!     true
//!   }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), querycache::CacheError> {
//!   let cache = QueryCache::global();
//!   cache.initialize(&Orm, CacheOptions::default()).await?;
//!
//!   cache.set_cache("user:42", &serde_json::json!({"name": "Ann"}), Some(Ttl::Seconds(60))).await?;
//!   let client = cache.client().expect("initialized");
//!   let user: Option<serde_json::Value> = client.get("user:42").await?;
//!   Ok(())
//! }
//! ```

pub mod cache;

pub use cache::{
  Backend, CacheClient, CacheError, CacheOptions, Completion, ConnectionEvent, ConnectionStatus,
  Connector, InMemoryStore, MemoryConnector, QueryCache, QueryHost, RecordedError,
  ReconnectOnError, RetryStrategy, StoreConnection, Ttl,
};
