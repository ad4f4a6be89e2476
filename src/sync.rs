//! Background sync: drain offline-recorded actions once connectivity returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Tag carried by connectivity-restore events meant for this queue.
pub const SYNC_TAG: &str = "background-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
  Pending,
  Synced,
}

impl SyncStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Synced => "synced",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "pending" => Some(Self::Pending),
      "synced" => Some(Self::Synced),
      _ => None,
    }
  }
}

/// An action the user took while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
  pub id: String,
  pub payload: Value,
  pub status: SyncStatus,
  pub created_at: DateTime<Utc>,
}

/// Durable store of offline actions.
///
/// `sync_item` must be idempotent: overlapping runs from different triggers
/// may deliver the same task twice.
#[async_trait]
pub trait OfflineStore: Send + Sync {
  /// Every pending task, in the order it should be delivered.
  async fn pending_items(&self) -> Result<Vec<SyncTask>>;

  /// Deliver one task upstream.
  async fn sync_item(&self, task: &SyncTask) -> Result<()>;

  /// Record a task as delivered. Never moves a task back to pending.
  async fn mark_synced(&self, id: &str) -> Result<()>;
}

/// What one pass over the queue did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  pub attempted: usize,
  pub synced: Vec<String>,
  pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
  Completed(SyncReport),
  /// Another pass was already running.
  Skipped,
  /// The event carried a tag this queue does not handle.
  Ignored,
}

pub struct SyncQueue<O: OfflineStore + ?Sized> {
  store: Arc<O>,
  running: AtomicBool,
}

/// Clears the running flag however the pass ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

impl<O: OfflineStore + ?Sized> SyncQueue<O> {
  pub fn new(store: Arc<O>) -> Self {
    Self {
      store,
      running: AtomicBool::new(false),
    }
  }

  pub fn store(&self) -> &Arc<O> {
    &self.store
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }

  /// Entry point for connectivity-restore events.
  pub async fn on_connectivity_restored(&self, tag: &str) -> Result<SyncOutcome> {
    if tag != SYNC_TAG {
      tracing::debug!(tag, "ignoring sync event");
      return Ok(SyncOutcome::Ignored);
    }
    self.process().await
  }

  /// Run one pass: deliver every pending task in order, one at a time.
  ///
  /// A task that fails stays pending and the pass moves on. Only failing to
  /// list the pending tasks fails the pass. A call made while a pass is in
  /// flight returns `Skipped` without touching the store.
  pub async fn process(&self) -> Result<SyncOutcome> {
    if self
      .running
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      tracing::debug!("sync already running, skipping");
      return Ok(SyncOutcome::Skipped);
    }
    let _guard = RunningGuard(&self.running);

    let tasks = self.store.pending_items().await?;
    let mut report = SyncReport::default();

    for task in tasks {
      if task.status == SyncStatus::Synced {
        continue;
      }
      report.attempted += 1;

      let delivered = match self.store.sync_item(&task).await {
        Ok(()) => self.store.mark_synced(&task.id).await,
        Err(err) => Err(err),
      };

      match delivered {
        Ok(()) => report.synced.push(task.id),
        Err(err) => {
          tracing::warn!(task = %task.id, error = %err, "sync failed, task stays pending");
          report.failed.push(task.id);
        }
      }
    }

    tracing::info!(
      attempted = report.attempted,
      synced = report.synced.len(),
      failed = report.failed.len(),
      "sync pass finished"
    );
    Ok(SyncOutcome::Completed(report))
  }
}
