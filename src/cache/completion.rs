//! Callback and fallback adapters for cache operation futures
//!
//! Every cache operation yields a single `Result`. `on_complete` hands that
//! same outcome to a callback before returning it; `or_fallback` turns a fault
//! into the miss value so callers that only want "cached or not" never block
//! on cache failures.

use futures_util::future::{Inspect, Map};
use futures_util::FutureExt;
use std::future::Future;

use super::error::CacheError;

pub trait Completion<T>: Future<Output = Result<T, CacheError>> + Sized {
  /// Invoke `callback` with the outcome, then return it unchanged
  fn on_complete<F>(self, callback: F) -> Inspect<Self, F>
  where
    F: FnOnce(&Result<T, CacheError>),
  {
    self.inspect(callback)
  }

  /// Log a fault and yield the miss/failure value (`None`, `false`)
  fn or_fallback(self) -> Map<Self, fn(Result<T, CacheError>) -> T>
  where
    T: Default,
  {
    self.map(fallback::<T> as fn(Result<T, CacheError>) -> T)
  }
}

impl<T, Fut> Completion<T> for Fut where Fut: Future<Output = Result<T, CacheError>> {}

fn fallback<T: Default>(result: Result<T, CacheError>) -> T {
  match result {
    Ok(value) => value,
    Err(e) => {
      tracing::warn!("Cache operation failed: {}", e);
      T::default()
    }
  }
}
