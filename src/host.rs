//! Capabilities the proxy needs from whatever hosts its clients.

use async_trait::async_trait;
use color_eyre::Result;
use serde::Serialize;
use std::sync::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::push::NotificationDescriptor;

/// Client-facing operations: version takeover, notifications, windows.
#[async_trait]
pub trait ClientHost: Send + Sync {
  /// Let a freshly installed version activate without waiting for clients
  /// of the previous version to close.
  async fn skip_waiting(&self);

  /// Make the active version serve every open client immediately.
  async fn claim_clients(&self);

  async fn show_notification(&self, notification: &NotificationDescriptor) -> Result<()>;

  async fn close_notification(&self);

  /// Open a window at `url`, or focus one that is already there.
  async fn open_window(&self, url: &str) -> Result<()>;
}

/// Something that happened on the host, for anyone listening.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
  SkipWaiting { version: String },
  ClientsClaimed { version: String },
  Notification(NotificationDescriptor),
  NotificationClosed,
  WindowOpened { url: String },
  WindowFocused { url: String },
}

/// Process host: tracks the controlling version and open windows, and
/// publishes every action on a broadcast channel.
pub struct BroadcastHost {
  version: String,
  controller: RwLock<Option<String>>,
  windows: Mutex<Vec<String>>,
  events: broadcast::Sender<HostEvent>,
}

impl BroadcastHost {
  pub fn new(version: impl Into<String>) -> Self {
    let (events, _) = broadcast::channel(64);
    Self {
      version: version.into(),
      controller: RwLock::new(None),
      windows: Mutex::new(Vec::new()),
      events,
    }
  }

  #[cfg(test)]
  pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
    self.events.subscribe()
  }

  /// Version currently controlling clients, if any has claimed them.
  pub fn controller(&self) -> Option<String> {
    self.controller.read().ok().and_then(|c| c.clone())
  }

  fn publish(&self, event: HostEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }
}

#[async_trait]
impl ClientHost for BroadcastHost {
  async fn skip_waiting(&self) {
    tracing::info!(version = %self.version, "skipping wait for previous version");
    self.publish(HostEvent::SkipWaiting {
      version: self.version.clone(),
    });
  }

  async fn claim_clients(&self) {
    if let Ok(mut controller) = self.controller.write() {
      *controller = Some(self.version.clone());
    }
    tracing::info!(version = %self.version, "claimed clients");
    self.publish(HostEvent::ClientsClaimed {
      version: self.version.clone(),
    });
  }

  async fn show_notification(&self, notification: &NotificationDescriptor) -> Result<()> {
    tracing::info!(title = %notification.title, "showing notification");
    self.publish(HostEvent::Notification(notification.clone()));
    Ok(())
  }

  async fn close_notification(&self) {
    self.publish(HostEvent::NotificationClosed);
  }

  async fn open_window(&self, url: &str) -> Result<()> {
    let already_open = match self.windows.lock() {
      Ok(mut windows) => {
        if windows.iter().any(|w| w == url) {
          true
        } else {
          windows.push(url.to_string());
          false
        }
      }
      Err(_) => false,
    };

    if already_open {
      self.publish(HostEvent::WindowFocused {
        url: url.to_string(),
      });
    } else {
      self.publish(HostEvent::WindowOpened {
        url: url.to_string(),
      });
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_claim_sets_controller() {
    let host = BroadcastHost::new("v2");
    assert_eq!(host.controller(), None);
    host.claim_clients().await;
    assert_eq!(host.controller(), Some("v2".to_string()));
  }

  #[tokio::test]
  async fn test_second_open_focuses() {
    let host = BroadcastHost::new("v1");
    let mut events = host.subscribe();

    host.open_window("/capture").await.unwrap();
    host.open_window("/capture").await.unwrap();

    assert_eq!(
      events.recv().await.unwrap(),
      HostEvent::WindowOpened {
        url: "/capture".into()
      }
    );
    assert_eq!(
      events.recv().await.unwrap(),
      HostEvent::WindowFocused {
        url: "/capture".into()
      }
    );
  }
}
