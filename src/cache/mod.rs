//! Query-result cache over a remote key-value store
//!
//! Provides:
//! - A cache client with lazy, de-duplicated connection establishment
//! - Prefix-namespaced keys and JSON-serialized values with TTL
//! - A connection state machine fed by transport events
//! - A facade owning the single active client, hot-swappable on reconfigure
//! - Redis and in-memory store backends

mod client;
mod completion;
pub mod config;
mod entry;
mod error;
mod events;
mod manager;
#[cfg(feature = "redis")]
pub mod proxy;
pub mod store;

pub use client::CacheClient;
pub use completion::Completion;
pub use config::{Backend, CacheOptions, ReconnectOnError, RetryStrategy};
pub use entry::Ttl;
pub use error::CacheError;
pub use events::{ConnectionEvent, ConnectionStatus, ConnectionTracker, RecordedError};
pub use manager::{QueryCache, QueryHost};
#[cfg(feature = "redis")]
pub use proxy::{RedisConnector, RedisProxyClient};
pub use store::{Connector, InMemoryStore, MemoryConnector, StoreConnection};
