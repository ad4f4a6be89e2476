use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::lifecycle::ControlMessage;
use crate::network::{Network, ProxyRequest};
use crate::push::NotificationDescriptor;
use crate::sync::{SyncOutcome, SYNC_TAG};

/// Platform events delivered to the proxy
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
  Install,
  Activate,
  /// Connectivity came back; `tag` names the queue that should drain
  ConnectivityRestored { tag: String },
  Push(Option<Vec<u8>>),
  NotificationClick {
    action: Option<String>,
    data: Value,
  },
  Message(ControlMessage),
}

/// What handling an event did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
  Installed,
  Activated { evicted: Vec<String> },
  Synced { result: SyncOutcome },
  Pushed { notification: Option<NotificationDescriptor> },
  WindowOpened { url: String },
  CacheCleaned { evicted: Vec<String> },
  WaitingSkipped,
}

/// Tracks reachability between heartbeats and reports the offline to online edge.
#[derive(Debug)]
pub struct Connectivity {
  online: bool,
}

impl Default for Connectivity {
  fn default() -> Self {
    Self { online: true }
  }
}

impl Connectivity {
  /// Record a heartbeat result. True when it brought us back online.
  pub fn observe(&mut self, reachable: bool) -> bool {
    let restored = reachable && !self.online;
    if reachable != self.online {
      tracing::info!(online = reachable, "connectivity changed");
    }
    self.online = reachable;
    restored
  }

  #[cfg(test)]
  pub fn is_online(&self) -> bool {
    self.online
  }
}

/// Event handler that queues platform events for the app
pub struct EventHandler {
  tx: mpsc::UnboundedSender<WorkerEvent>,
  rx: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Handle for pushing events from elsewhere
  pub fn sender(&self) -> mpsc::UnboundedSender<WorkerEvent> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<WorkerEvent> {
    self.rx.recv().await
  }
}

/// HEAD the origin every `interval` and emit `ConnectivityRestored` for the
/// background-sync queue whenever it becomes reachable again. Returns once
/// nobody is listening.
pub async fn watch_origin<N>(
  network: Arc<N>,
  heartbeat: ProxyRequest,
  interval: Duration,
  tx: mpsc::UnboundedSender<WorkerEvent>,
) where
  N: Network + ?Sized,
{
  if interval.is_zero() {
    tracing::warn!("heartbeat interval is zero, not watching connectivity");
    return;
  }

  let mut ticker = tokio::time::interval(interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
  let mut connectivity = Connectivity::default();
  loop {
    ticker.tick().await;
    // Any answer at all means the origin is reachable
    let reachable = network.fetch(&heartbeat).await.is_ok();
    if connectivity.observe(reachable) {
      let event = WorkerEvent::ConnectivityRestored {
        tag: SYNC_TAG.to_string(),
      };
      if tx.send(event).is_err() {
        break;
      }
    }
  }
}
