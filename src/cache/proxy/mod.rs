//! Redis backend for connecting to external Redis servers

mod client;

pub use client::{RedisConnector, RedisProxyClient};
