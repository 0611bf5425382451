//! Connection state machine driven by transport events

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;

/// Number of connection errors kept for diagnostics
pub const ERROR_HISTORY_LIMIT: usize = 5;

/// Connection status of a cache client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
  #[default]
  Disconnected,
  Connecting,
  Connected,
  Errored,
}

impl std::fmt::Display for ConnectionStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ConnectionStatus::Disconnected => write!(f, "disconnected"),
      ConnectionStatus::Connecting => write!(f, "connecting"),
      ConnectionStatus::Connected => write!(f, "connected"),
      ConnectionStatus::Errored => write!(f, "errored"),
    }
  }
}

/// Event reported by the client or its transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
  /// A connection attempt started
  Connecting,
  /// The transport opened a socket
  Connect,
  /// The connection accepts commands
  Ready,
  /// A connection-level error occurred
  Error(String),
  /// The connection ended
  End,
}

impl std::fmt::Display for ConnectionEvent {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ConnectionEvent::Connecting => write!(f, "connecting"),
      ConnectionEvent::Connect => write!(f, "connect"),
      ConnectionEvent::Ready => write!(f, "ready"),
      ConnectionEvent::Error(msg) => write!(f, "error: {}", msg),
      ConnectionEvent::End => write!(f, "end"),
    }
  }
}

/// A connection error kept in the history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedError {
  pub message: String,
  pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ConnectionState {
  status: ConnectionStatus,
  /// Most recent first
  errors: VecDeque<RecordedError>,
}

impl ConnectionState {
  fn apply(&mut self, event: &ConnectionEvent) {
    match event {
      ConnectionEvent::Connecting => self.status = ConnectionStatus::Connecting,
      ConnectionEvent::Connect => {}
      ConnectionEvent::Ready => self.status = ConnectionStatus::Connected,
      ConnectionEvent::Error(message) => {
        self.errors.push_front(RecordedError {
          message: message.clone(),
          at: Utc::now(),
        });
        self.errors.truncate(ERROR_HISTORY_LIMIT);
        if self.status == ConnectionStatus::Connecting {
          self.status = ConnectionStatus::Errored;
        }
      }
      ConnectionEvent::End => self.status = ConnectionStatus::Disconnected,
    }
  }
}

/// Shared connection state plus a broadcast feed of the events applied to it
pub struct ConnectionTracker {
  state: RwLock<ConnectionState>,
  event_tx: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionTracker {
  pub fn new() -> Self {
    let (event_tx, _) = broadcast::channel(64);
    Self {
      state: RwLock::new(ConnectionState::default()),
      event_tx,
    }
  }

  /// Apply an event to the state machine and publish it
  pub fn emit(&self, event: ConnectionEvent) {
    self.state.write().apply(&event);
    match &event {
      ConnectionEvent::Error(msg) => tracing::warn!("Cache connection error: {}", msg),
      other => tracing::debug!("Cache connection {}", other),
    }
    let _ = self.event_tx.send(event);
  }

  pub fn status(&self) -> ConnectionStatus {
    self.state.read().status
  }

  pub fn last_error(&self) -> Option<String> {
    self.state.read().errors.front().map(|e| e.message.clone())
  }

  pub fn recent_errors(&self) -> Vec<RecordedError> {
    self.state.read().errors.iter().cloned().collect()
  }

  /// Subscribe to connection events
  pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
    self.event_tx.subscribe()
  }
}

impl Default for ConnectionTracker {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_connect_sequence() {
    let tracker = ConnectionTracker::new();
    assert_eq!(tracker.status(), ConnectionStatus::Disconnected);

    tracker.emit(ConnectionEvent::Connecting);
    assert_eq!(tracker.status(), ConnectionStatus::Connecting);

    tracker.emit(ConnectionEvent::Connect);
    assert_eq!(tracker.status(), ConnectionStatus::Connecting);

    tracker.emit(ConnectionEvent::Ready);
    assert_eq!(tracker.status(), ConnectionStatus::Connected);

    tracker.emit(ConnectionEvent::End);
    assert_eq!(tracker.status(), ConnectionStatus::Disconnected);
  }

  #[test]
  fn test_error_while_connecting() {
    let tracker = ConnectionTracker::new();
    tracker.emit(ConnectionEvent::Connecting);
    tracker.emit(ConnectionEvent::Error("ECONNREFUSED".to_string()));
    assert_eq!(tracker.status(), ConnectionStatus::Errored);
    assert_eq!(tracker.last_error().as_deref(), Some("ECONNREFUSED"));
  }

  #[test]
  fn test_error_while_connected_keeps_status() {
    let tracker = ConnectionTracker::new();
    tracker.emit(ConnectionEvent::Ready);
    tracker.emit(ConnectionEvent::Error("READONLY".to_string()));
    assert_eq!(tracker.status(), ConnectionStatus::Connected);
  }

  #[test]
  fn test_error_history_is_bounded() {
    let tracker = ConnectionTracker::new();
    for i in 0..8 {
      tracker.emit(ConnectionEvent::Error(format!("error {}", i)));
    }

    let errors = tracker.recent_errors();
    assert_eq!(errors.len(), ERROR_HISTORY_LIMIT);
    assert_eq!(errors[0].message, "error 7");
    assert_eq!(errors[4].message, "error 3");
    assert_eq!(tracker.last_error().as_deref(), Some("error 7"));
  }

  #[tokio::test]
  async fn test_events_are_broadcast() {
    let tracker = ConnectionTracker::new();
    let mut rx = tracker.subscribe();

    tracker.emit(ConnectionEvent::Connecting);
    tracker.emit(ConnectionEvent::Ready);

    assert_eq!(rx.recv().await.unwrap(), ConnectionEvent::Connecting);
    assert_eq!(rx.recv().await.unwrap(), ConnectionEvent::Ready);
  }
}
