//! In-memory fakes for the capability traits, shared by unit tests.

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::cache::{CacheStorage, StoredResponse};
use crate::host::{ClientHost, HostEvent};
use crate::network::{FetchError, Network, ProxyRequest};
use crate::push::NotificationDescriptor;
use crate::sync::{OfflineStore, SyncStatus, SyncTask};

/// Network that answers from a fixed table and can be switched offline.
#[derive(Default)]
pub struct FakeNetwork {
  responses: HashMap<String, (u16, Vec<u8>)>,
  offline: AtomicBool,
  calls: AtomicUsize,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_response(mut self, url: &str, status: u16, body: &str) -> Self {
    self
      .responses
      .insert(url.to_string(), (status, body.as_bytes().to_vec()));
    self
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &ProxyRequest) -> Result<StoredResponse, FetchError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if self.offline.load(Ordering::SeqCst) {
      return Err(FetchError::Unreachable("offline".to_string()));
    }
    Ok(match self.responses.get(request.url.as_str()) {
      Some((status, body)) => StoredResponse::new(*status, Vec::new(), body.clone()),
      None => StoredResponse::synthesized(404, "no such route"),
    })
  }
}

/// Storage where every operation fails, as when the quota is exhausted.
pub struct FailingStorage;

impl CacheStorage for FailingStorage {
  fn open(&self, _name: &str) -> Result<()> {
    Err(eyre!("quota exceeded"))
  }

  fn match_in(&self, _name: &str, _key: &str) -> Result<Option<StoredResponse>> {
    Err(eyre!("quota exceeded"))
  }

  fn match_any(&self, _key: &str) -> Result<Option<StoredResponse>> {
    Err(eyre!("quota exceeded"))
  }

  fn put(&self, _name: &str, _key: &str, _response: &StoredResponse) -> Result<()> {
    Err(eyre!("quota exceeded"))
  }

  fn delete(&self, _name: &str) -> Result<bool> {
    Err(eyre!("quota exceeded"))
  }

  fn keys(&self) -> Result<Vec<String>> {
    Err(eyre!("quota exceeded"))
  }
}

/// Host that records what it was asked to do.
#[derive(Default)]
pub struct RecordingHost {
  events: Mutex<Vec<HostEvent>>,
}

impl RecordingHost {
  pub fn events(&self) -> Vec<HostEvent> {
    self.events.lock().unwrap().clone()
  }

  fn record(&self, event: HostEvent) {
    self.events.lock().unwrap().push(event);
  }
}

#[async_trait]
impl ClientHost for RecordingHost {
  async fn skip_waiting(&self) {
    self.record(HostEvent::SkipWaiting {
      version: "recording".into(),
    });
  }

  async fn claim_clients(&self) {
    self.record(HostEvent::ClientsClaimed {
      version: "recording".into(),
    });
  }

  async fn show_notification(&self, notification: &NotificationDescriptor) -> Result<()> {
    self.record(HostEvent::Notification(notification.clone()));
    Ok(())
  }

  async fn close_notification(&self) {
    self.record(HostEvent::NotificationClosed);
  }

  async fn open_window(&self, url: &str) -> Result<()> {
    self.record(HostEvent::WindowOpened {
      url: url.to_string(),
    });
    Ok(())
  }
}

/// Offline store backed by a Vec, with scriptable delivery failures.
#[derive(Default)]
pub struct MemoryOfflineStore {
  tasks: Mutex<Vec<SyncTask>>,
  failing: Mutex<HashSet<String>>,
  delivered: Mutex<Vec<String>>,
  delay: Mutex<Option<Duration>>,
}

impl MemoryOfflineStore {
  pub fn with_tasks(ids: &[&str]) -> Self {
    let tasks = ids
      .iter()
      .map(|id| SyncTask {
        id: id.to_string(),
        payload: json!({ "action": "capture", "id": id }),
        status: SyncStatus::Pending,
        created_at: Utc::now(),
      })
      .collect();
    Self {
      tasks: Mutex::new(tasks),
      ..Self::default()
    }
  }

  pub fn fail_on(&self, id: &str) {
    self.failing.lock().unwrap().insert(id.to_string());
  }

  pub fn clear_failures(&self) {
    self.failing.lock().unwrap().clear();
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn status(&self, id: &str) -> Option<SyncStatus> {
    self
      .tasks
      .lock()
      .unwrap()
      .iter()
      .find(|t| t.id == id)
      .map(|t| t.status)
  }

  pub fn delivered(&self) -> Vec<String> {
    self.delivered.lock().unwrap().clone()
  }
}

#[async_trait]
impl OfflineStore for MemoryOfflineStore {
  async fn pending_items(&self) -> Result<Vec<SyncTask>> {
    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    Ok(
      self
        .tasks
        .lock()
        .unwrap()
        .iter()
        .filter(|t| t.status == SyncStatus::Pending)
        .cloned()
        .collect(),
    )
  }

  async fn sync_item(&self, task: &SyncTask) -> Result<()> {
    self.delivered.lock().unwrap().push(task.id.clone());
    if self.failing.lock().unwrap().contains(&task.id) {
      return Err(eyre!("upstream rejected {}", task.id));
    }
    Ok(())
  }

  async fn mark_synced(&self, id: &str) -> Result<()> {
    let mut tasks = self.tasks.lock().unwrap();
    let task = tasks
      .iter_mut()
      .find(|t| t.id == id)
      .ok_or_else(|| eyre!("unknown sync task {}", id))?;
    task.status = SyncStatus::Synced;
    Ok(())
  }
}
