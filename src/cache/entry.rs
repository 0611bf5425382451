//! Stored entry types

use std::time::Duration;
use tokio::time::Instant;

/// Expiry requested for a cache write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Ttl {
  /// Mode-dependent default (300s serverless, 60s otherwise)
  #[default]
  Default,
  /// Never expires
  Forever,
  /// Expires after the given number of seconds
  Seconds(u64),
}

impl Ttl {
  /// Resolve to the expiry in seconds attached to the key, `None` = no expiry
  pub fn resolve(self, default_secs: u64) -> Option<u64> {
    match self {
      Ttl::Forever => None,
      Ttl::Default | Ttl::Seconds(0) => Some(default_secs),
      Ttl::Seconds(secs) => Some(secs),
    }
  }
}

/// `-1` means no expiry, positive values are seconds, anything else falls back
/// to the default.
impl From<i64> for Ttl {
  fn from(ttl: i64) -> Self {
    match ttl {
      -1 => Ttl::Forever,
      n if n > 0 => Ttl::Seconds(n as u64),
      _ => Ttl::Default,
    }
  }
}

/// Sub-second remainders round up, so a non-zero duration never becomes
/// the mode default.
impl From<Duration> for Ttl {
  fn from(d: Duration) -> Self {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    if secs == 0 {
      Ttl::Default
    } else {
      Ttl::Seconds(secs)
    }
  }
}

/// A value held by the in-memory store
#[derive(Debug, Clone)]
pub struct StoredValue {
  /// Serialized JSON text
  pub value: String,
  pub expires_at: Option<Instant>,
}

impl StoredValue {
  /// An expiry past the clock's range is treated as no expiry
  pub fn new(value: String, expiry_secs: Option<u64>) -> Self {
    let now = Instant::now();
    Self {
      value,
      expires_at: expiry_secs.and_then(|secs| now.checked_add(Duration::from_secs(secs))),
    }
  }

  pub fn is_expired(&self) -> bool {
    self
      .expires_at
      .map(|exp| Instant::now() >= exp)
      .unwrap_or(false)
  }

  pub fn ttl_remaining(&self) -> Option<Duration> {
    self.expires_at.and_then(|exp| {
      let now = Instant::now();
      if now >= exp {
        None
      } else {
        Some(exp - now)
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_ttl_from_i64() {
    assert_eq!(Ttl::from(-1), Ttl::Forever);
    assert_eq!(Ttl::from(0), Ttl::Default);
    assert_eq!(Ttl::from(30), Ttl::Seconds(30));
    assert_eq!(Ttl::from(-7), Ttl::Default);
  }

  #[test]
  fn test_ttl_resolve() {
    assert_eq!(Ttl::Forever.resolve(60), None);
    assert_eq!(Ttl::Default.resolve(300), Some(300));
    assert_eq!(Ttl::Seconds(0).resolve(60), Some(60));
    assert_eq!(Ttl::Seconds(2).resolve(60), Some(2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_stored_value_expiry() {
    let value = StoredValue::new("1".to_string(), Some(2));
    assert!(!value.is_expired());
    assert_eq!(value.ttl_remaining(), Some(Duration::from_secs(2)));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(value.is_expired());
    assert_eq!(value.ttl_remaining(), None);

    let forever = StoredValue::new("1".to_string(), None);
    assert!(!forever.is_expired());
  }

  #[tokio::test]
  async fn test_huge_expiry_does_not_overflow() {
    let value = StoredValue::new("1".to_string(), Some(i64::MAX as u64));
    assert!(!value.is_expired());

    let value = StoredValue::new("1".to_string(), Some(u64::MAX));
    assert_eq!(value.expires_at, None);
  }

  #[test]
  fn test_ttl_from_duration_rounds_up() {
    assert_eq!(Ttl::from(Duration::from_millis(500)), Ttl::Seconds(1));
    assert_eq!(Ttl::from(Duration::from_millis(2001)), Ttl::Seconds(3));
    assert_eq!(Ttl::from(Duration::from_secs(5)), Ttl::Seconds(5));
    assert_eq!(Ttl::from(Duration::ZERO), Ttl::Default);
  }
}
