//! Cache client configuration

use serde::{Deserialize, Deserializer, Serialize};
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Error patterns that trigger a reconnect/retry by default: read-only
/// replicas, timeouts, resets and refusals.
pub const DEFAULT_RECONNECT_PATTERNS: &[&str] = &[
  "READONLY",
  "ETIMEDOUT",
  "timed out",
  "ECONNRESET",
  "connection reset",
  "ECONNREFUSED",
  "connection refused",
];

/// Backing store for the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
  /// External Redis server (default)
  #[default]
  Redis,
  /// In-process store
  Memory,
}

impl std::fmt::Display for Backend {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Backend::Redis => write!(f, "redis"),
      Backend::Memory => write!(f, "memory"),
    }
  }
}

impl std::str::FromStr for Backend {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "redis" | "proxy" | "external" => Ok(Backend::Redis),
      "memory" | "inmemory" | "builtin" => Ok(Backend::Memory),
      _ => Err(format!("Unknown cache backend: {}", s)),
    }
  }
}

/// Backoff between transport retries, as a function of the attempt number
/// (starting at 1). `None` stops retrying.
#[derive(Clone)]
pub struct RetryStrategy(Arc<dyn Fn(u32) -> Option<Duration> + Send + Sync>);

impl RetryStrategy {
  pub fn new(f: impl Fn(u32) -> Option<Duration> + Send + Sync + 'static) -> Self {
    Self(Arc::new(f))
  }

  pub fn delay(&self, attempt: u32) -> Option<Duration> {
    (self.0)(attempt)
  }
}

impl Default for RetryStrategy {
  fn default() -> Self {
    Self::new(|attempt| Some(Duration::from_millis((attempt as u64 * 100).min(1000))))
  }
}

impl std::fmt::Debug for RetryStrategy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("RetryStrategy(..)")
  }
}

/// Predicate over an error message deciding whether the failed command is
/// retried on a reconnected transport
#[derive(Clone)]
pub struct ReconnectOnError(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl ReconnectOnError {
  pub fn new(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
    Self(Arc::new(f))
  }

  /// Case-insensitive substring match against any of `patterns`
  pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
    if patterns.is_empty() {
      return Ok(Self::never());
    }
    let alternation = patterns
      .iter()
      .map(|p| regex::escape(p.as_ref()))
      .collect::<Vec<_>>()
      .join("|");
    let regex = Regex::new(&format!("(?i){}", alternation))?;
    Ok(Self::new(move |message| regex.is_match(message)))
  }

  pub fn never() -> Self {
    Self::new(|_| false)
  }

  pub fn matches(&self, message: &str) -> bool {
    (self.0)(message)
  }
}

impl Default for ReconnectOnError {
  fn default() -> Self {
    Self::from_patterns(DEFAULT_RECONNECT_PATTERNS).unwrap_or_else(|_| Self::never())
  }
}

impl std::fmt::Debug for ReconnectOnError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("ReconnectOnError(..)")
  }
}

impl<'de> Deserialize<'de> for ReconnectOnError {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let patterns = Vec::<String>::deserialize(deserializer)?;
    Self::from_patterns(&patterns).map_err(serde::de::Error::custom)
  }
}

/// Cache client options. Every field is optional in a config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheOptions {
  /// Backing store
  #[serde(default)]
  pub backend: Backend,

  /// Redis host
  #[serde(default = "default_host")]
  pub host: String,

  /// Redis port
  #[serde(default = "default_port")]
  pub port: u16,

  /// Redis password (optional)
  #[serde(default)]
  pub password: Option<String>,

  /// Redis database number
  #[serde(default)]
  pub database: u8,

  /// Enable TLS
  #[serde(default)]
  pub tls_enabled: bool,

  /// Namespace prepended to every key
  #[serde(default = "default_prefix")]
  pub prefix: String,

  /// Connect timeout in milliseconds
  #[serde(default = "default_connect_timeout")]
  pub connect_timeout: u64,

  /// Transport retries per command before the error reaches the caller
  #[serde(default = "default_max_retries")]
  pub max_retries_per_request: u32,

  /// Backoff between retries (code-only)
  #[serde(skip)]
  pub retry_strategy: RetryStrategy,

  /// Let operations wait for an in-flight connect instead of failing fast
  #[serde(default = "default_true")]
  pub enable_offline_queue: bool,

  /// Heartbeat interval in milliseconds (0 = disabled)
  #[serde(default = "default_keep_alive")]
  pub keep_alive: u64,

  /// Which errors trigger a retry; a list of patterns in config files
  #[serde(default, skip_serializing)]
  pub reconnect_on_error: ReconnectOnError,

  /// Lazy connect, bounded connect timeout, longer default TTL
  #[serde(default)]
  pub serverless_mode: bool,
}

fn default_host() -> String {
  "127.0.0.1".to_string()
}

fn default_port() -> u16 {
  6379
}

fn default_prefix() -> String {
  "cachegoose:".to_string()
}

fn default_connect_timeout() -> u64 {
  5000
}

fn default_max_retries() -> u32 {
  3
}

fn default_true() -> bool {
  true
}

fn default_keep_alive() -> u64 {
  10_000
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      backend: Backend::default(),
      host: default_host(),
      port: default_port(),
      password: None,
      database: 0,
      tls_enabled: false,
      prefix: default_prefix(),
      connect_timeout: default_connect_timeout(),
      max_retries_per_request: default_max_retries(),
      retry_strategy: RetryStrategy::default(),
      enable_offline_queue: true,
      keep_alive: default_keep_alive(),
      reconnect_on_error: ReconnectOnError::default(),
      serverless_mode: false,
    }
  }
}

/// Default expiry in serverless mode
pub const SERVERLESS_DEFAULT_TTL_SECS: u64 = 300;
/// Default expiry otherwise
pub const DEFAULT_TTL_SECS: u64 = 60;

impl CacheOptions {
  /// Options for the in-process backend
  pub fn memory() -> Self {
    Self {
      backend: Backend::Memory,
      ..Self::default()
    }
  }

  pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.prefix = prefix.into();
    self
  }

  pub fn with_serverless_mode(mut self, serverless: bool) -> Self {
    self.serverless_mode = serverless;
    self
  }

  /// Generate Redis connection URL
  pub fn connection_url(&self) -> String {
    let scheme = if self.tls_enabled { "rediss" } else { "redis" };
    let auth = match &self.password {
      Some(pwd) if !pwd.is_empty() => format!(":{}@", pwd),
      _ => String::new(),
    };
    format!(
      "{}://{}{}:{}/{}",
      scheme, auth, self.host, self.port, self.database
    )
  }

  pub fn connect_timeout_duration(&self) -> Duration {
    Duration::from_millis(self.connect_timeout)
  }

  pub fn keep_alive_interval(&self) -> Option<Duration> {
    (self.keep_alive > 0).then(|| Duration::from_millis(self.keep_alive))
  }

  /// Expiry applied when a write does not specify one
  pub fn default_ttl_secs(&self) -> u64 {
    if self.serverless_mode {
      SERVERLESS_DEFAULT_TTL_SECS
    } else {
      DEFAULT_TTL_SECS
    }
  }

  pub fn from_yaml(content: &str) -> Result<Self, anyhow::Error> {
    let expanded = expand_env_vars(content);
    Ok(serde_yaml::from_str(&expanded)?)
  }

  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let content = std::fs::read_to_string(&path)?;
    Self::from_yaml(&content)
  }

  pub fn find_and_load() -> Result<Option<Self>, anyhow::Error> {
    for p in ["querycache.yaml", "querycache.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading cache config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }
}

/// Expand environment variables in a string.
/// Supports $VAR_NAME and ${VAR_NAME} syntax; unset variables expand to "".
pub fn expand_env_vars(input: &str) -> String {
  static ENV_VAR: OnceLock<Regex> = OnceLock::new();
  let pattern = ENV_VAR.get_or_init(|| {
    Regex::new(r"\$\{([^}]*)\}|\$([A-Za-z0-9_]+)").expect("env var pattern is valid")
  });

  pattern
    .replace_all(input, |caps: &regex::Captures| {
      let name = caps
        .get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str())
        .unwrap_or_default();
      std::env::var(name).unwrap_or_default()
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_retry_strategy() {
    let strategy = RetryStrategy::default();
    assert_eq!(strategy.delay(1), Some(Duration::from_millis(100)));
    assert_eq!(strategy.delay(5), Some(Duration::from_millis(500)));
    assert_eq!(strategy.delay(10), Some(Duration::from_millis(1000)));
    assert_eq!(strategy.delay(50), Some(Duration::from_millis(1000)));
  }

  #[test]
  fn test_default_reconnect_predicate() {
    let predicate = ReconnectOnError::default();
    assert!(predicate.matches("READONLY You can't write against a read only replica."));
    assert!(predicate.matches("connect ETIMEDOUT"));
    assert!(predicate.matches("Connection reset by peer (os error 104)"));
    assert!(predicate.matches("Connection refused (os error 111)"));
    assert!(!predicate.matches("WRONGTYPE Operation against a key holding the wrong kind of value"));
  }

  #[test]
  fn test_connection_url() {
    let mut options = CacheOptions::default();
    assert_eq!(options.connection_url(), "redis://127.0.0.1:6379/0");

    options.password = Some("secret".to_string());
    options.tls_enabled = true;
    options.database = 2;
    assert_eq!(options.connection_url(), "rediss://:secret@127.0.0.1:6379/2");
  }

  #[test]
  fn test_default_ttl_by_mode() {
    let options = CacheOptions::default();
    assert_eq!(options.default_ttl_secs(), 60);
    assert_eq!(
      options.with_serverless_mode(true).default_ttl_secs(),
      300
    );
  }

  #[test]
  fn test_keep_alive_interval() {
    let mut options = CacheOptions::default();
    assert_eq!(
      options.keep_alive_interval(),
      Some(Duration::from_millis(10_000))
    );
    options.keep_alive = 0;
    assert_eq!(options.keep_alive_interval(), None);
  }
}
