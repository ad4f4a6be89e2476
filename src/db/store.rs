//! Durable offline store backed by the local database.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use url::Url;

use super::DatabaseSlot;
use crate::sync::{OfflineStore, SyncTask};

/// Delivers one offline action upstream.
#[async_trait]
pub trait SyncTransport: Send + Sync {
  async fn deliver(&self, task: &SyncTask) -> Result<()>;
}

/// POSTs each task's payload to the origin's sync endpoint.
///
/// The task id travels as `Idempotency-Key` so the origin can drop
/// duplicates from overlapping sync runs.
pub struct HttpSyncTransport {
  client: reqwest::Client,
  endpoint: Option<Url>,
}

impl HttpSyncTransport {
  pub fn new(client: reqwest::Client, endpoint: Option<Url>) -> Self {
    Self { client, endpoint }
  }
}

#[async_trait]
impl SyncTransport for HttpSyncTransport {
  async fn deliver(&self, task: &SyncTask) -> Result<()> {
    let endpoint = self
      .endpoint
      .clone()
      .ok_or_else(|| eyre!("No sync endpoint configured for task {}", task.id))?;
    let body = serde_json::to_vec(&task.payload)
      .map_err(|e| eyre!("Failed to serialize sync task {}: {}", task.id, e))?;

    let response = self
      .client
      .post(endpoint)
      .header("content-type", "application/json")
      .header("idempotency-key", task.id.as_str())
      .body(body)
      .send()
      .await
      .map_err(|e| eyre!("Failed to deliver sync task {}: {}", task.id, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("Origin rejected sync task {}: {}", task.id, status));
    }
    Ok(())
  }
}

/// `OfflineStore` over the local database and a transport.
pub struct SqliteOfflineStore<T: SyncTransport + ?Sized> {
  db: Arc<DatabaseSlot>,
  transport: Arc<T>,
}

impl<T: SyncTransport + ?Sized> SqliteOfflineStore<T> {
  pub fn new(db: Arc<DatabaseSlot>, transport: Arc<T>) -> Self {
    Self { db, transport }
  }

  /// Record an action for later delivery.
  pub fn enqueue(&self, payload: &serde_json::Value) -> Result<SyncTask> {
    let task = self.db.get()?.enqueue_task(payload)?;
    tracing::info!(task = %task.id, "recorded offline action");
    Ok(task)
  }
}

#[async_trait]
impl<T: SyncTransport + ?Sized> OfflineStore for SqliteOfflineStore<T> {
  async fn pending_items(&self) -> Result<Vec<SyncTask>> {
    self.db.get()?.pending_tasks()
  }

  async fn sync_item(&self, task: &SyncTask) -> Result<()> {
    self.transport.deliver(task).await
  }

  async fn mark_synced(&self, id: &str) -> Result<()> {
    self.db.get()?.mark_synced(id)
  }
}
