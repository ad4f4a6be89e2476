//! Production bootstrap steps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::bootstrap::BootstrapSteps;
use crate::config::Config;
use crate::db::{Database, DatabaseSlot};
use crate::sync::{OfflineStore, SyncOutcome, SyncQueue};

/// What the local database held when the app came up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfflineSnapshot {
  pub pending: usize,
  pub oldest_pending: Option<DateTime<Utc>>,
  pub hydrated_at: DateTime<Utc>,
}

pub struct AppSteps<O: OfflineStore + ?Sized> {
  config: Config,
  db: Arc<DatabaseSlot>,
  queue: Arc<SyncQueue<O>>,
  snapshot: RwLock<Option<OfflineSnapshot>>,
  timer: Mutex<Option<JoinHandle<()>>>,
}

impl<O: OfflineStore + ?Sized + 'static> AppSteps<O> {
  pub fn new(config: Config, db: Arc<DatabaseSlot>, queue: Arc<SyncQueue<O>>) -> Self {
    Self {
      config,
      db,
      queue,
      snapshot: RwLock::new(None),
      timer: Mutex::new(None),
    }
  }

  pub fn snapshot(&self) -> Option<OfflineSnapshot> {
    self.snapshot.read().ok().and_then(|s| s.clone())
  }

  /// Stop the auto-sync timer, if one is scheduled.
  pub fn cancel_timer(&self) {
    if let Ok(mut timer) = self.timer.lock() {
      if let Some(handle) = timer.take() {
        handle.abort();
        tracing::debug!("auto-sync timer cancelled");
      }
    }
  }

  fn spawn_timer(&self, period: Duration) -> JoinHandle<()> {
    let queue = self.queue.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
        ticker.tick().await;
        match queue.process().await {
          Ok(SyncOutcome::Completed(report)) => tracing::info!(
            attempted = report.attempted,
            synced = report.synced.len(),
            failed = report.failed.len(),
            "auto-sync pass finished"
          ),
          Ok(outcome) => tracing::debug!(?outcome, "auto-sync pass did not run"),
          Err(err) => tracing::warn!(error = %err, "auto-sync pass failed"),
        }
      }
    })
  }
}

#[async_trait]
impl<O: OfflineStore + ?Sized + 'static> BootstrapSteps for AppSteps<O> {
  async fn validate_config(&self) -> Result<()> {
    self.config.validate()
  }

  async fn init_db(&self) -> Result<()> {
    let path = self.config.database_path()?;
    let db = tokio::task::spawn_blocking(move || Database::open(&path))
      .await
      .map_err(|e| eyre!("Database open task failed: {}", e))??;
    self.db.set(db)
  }

  async fn init_store(&self) -> Result<()> {
    let pending = self.db.get()?.pending_tasks()?;
    let snapshot = OfflineSnapshot {
      pending: pending.len(),
      oldest_pending: pending.iter().map(|t| t.created_at).min(),
      hydrated_at: Utc::now(),
    };
    tracing::info!(pending = snapshot.pending, "hydrated offline store");

    let mut slot = self
      .snapshot
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *slot = Some(snapshot);
    Ok(())
  }

  async fn schedule_sync(&self) -> Result<()> {
    let period = self.config.sync_interval();
    let mut timer = self
      .timer
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if let Some(previous) = timer.take() {
      previous.abort();
    }
    *timer = Some(self.spawn_timer(period));
    tracing::info!(interval_secs = period.as_secs(), "auto-sync scheduled");
    Ok(())
  }

  async fn clean_files(&self) -> Result<usize> {
    let dir = self.config.files_dir()?;
    purge_stale_files(&dir, self.config.file_retention()).await
  }
}

/// Delete regular files in `dir` last modified at least `retention` ago.
/// A missing directory has nothing to purge.
pub async fn purge_stale_files(dir: &Path, retention: Duration) -> Result<usize> {
  let mut entries = match tokio::fs::read_dir(dir).await {
    Ok(entries) => entries,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
    Err(e) => return Err(eyre!("Failed to read {}: {}", dir.display(), e)),
  };

  let cutoff = SystemTime::now()
    .checked_sub(retention)
    .unwrap_or(SystemTime::UNIX_EPOCH);

  let mut removed = 0;
  while let Some(entry) = entries
    .next_entry()
    .await
    .map_err(|e| eyre!("Failed to read {}: {}", dir.display(), e))?
  {
    let path = entry.path();
    let metadata = entry
      .metadata()
      .await
      .map_err(|e| eyre!("Failed to stat {}: {}", path.display(), e))?;
    if !metadata.is_file() {
      continue;
    }

    let modified = metadata
      .modified()
      .map_err(|e| eyre!("Failed to stat {}: {}", path.display(), e))?;
    if modified <= cutoff {
      tokio::fs::remove_file(&path)
        .await
        .map_err(|e| eyre!("Failed to remove {}: {}", path.display(), e))?;
      tracing::debug!(file = %path.display(), "removed stale offline file");
      removed += 1;
    }
  }
  Ok(removed)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bootstrap::{Bootstrap, Phase, Readiness};
  use crate::testing::MemoryOfflineStore;

  fn steps(config: Config) -> (Arc<AppSteps<MemoryOfflineStore>>, Arc<DatabaseSlot>) {
    let db = Arc::new(DatabaseSlot::default());
    let queue = Arc::new(SyncQueue::new(Arc::new(MemoryOfflineStore::default())));
    (Arc::new(AppSteps::new(config, db.clone(), queue)), db)
  }

  fn config_in(dir: &Path, retention_days: u64) -> Config {
    let mut config = Config::from_yaml("origin: https://field.test").unwrap();
    config.data_dir = Some(dir.to_path_buf());
    config.files.retention_days = retention_days;
    config
  }

  #[tokio::test]
  async fn test_purge_honours_retention() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("photo.jpg"), b"jpeg").unwrap();
    std::fs::create_dir(dir.path().join("nested")).unwrap();

    let kept = purge_stale_files(dir.path(), Duration::from_secs(3600)).await.unwrap();
    assert_eq!(kept, 0);
    assert!(dir.path().join("photo.jpg").exists());

    let removed = purge_stale_files(dir.path(), Duration::ZERO).await.unwrap();
    assert_eq!(removed, 1);
    assert!(!dir.path().join("photo.jpg").exists());
    assert!(dir.path().join("nested").exists());
  }

  #[tokio::test]
  async fn test_purge_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let removed = purge_stale_files(&dir.path().join("absent"), Duration::ZERO)
      .await
      .unwrap();
    assert_eq!(removed, 0);
  }

  #[tokio::test]
  async fn test_bootstrap_with_app_steps() {
    let dir = tempfile::tempdir().unwrap();
    let files = dir.path().join("files");
    std::fs::create_dir_all(&files).unwrap();
    std::fs::write(files.join("old.pdf"), b"pdf").unwrap();

    let (steps, db) = steps(config_in(dir.path(), 0));
    let bootstrap = Bootstrap::new(steps.clone());

    let state = bootstrap.run().await.unwrap();

    assert_eq!(state.phase, Phase::Ready);
    assert!(db.get().is_ok());
    assert!(dir.path().join("offline.db").exists());
    assert!(!files.join("old.pdf").exists());
    let snapshot = steps.snapshot().unwrap();
    assert_eq!(snapshot.pending, 0);
    assert_eq!(snapshot.oldest_pending, None);

    // Rescheduling replaces the timer rather than adding one
    steps.schedule_sync().await.unwrap();
    steps.cancel_timer();
  }

  #[tokio::test]
  async fn test_invalid_config_fails_before_db() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path(), 7);
    config.origin = None;
    let (steps, db) = steps(config);
    let bootstrap = Bootstrap::new(steps);

    bootstrap.run().await.unwrap();

    assert!(matches!(bootstrap.readiness(), Readiness::Failed(msg) if msg.contains("No origin")));
    assert!(db.get().is_err());
    assert!(!dir.path().join("offline.db").exists());
  }

  #[tokio::test]
  async fn test_snapshot_counts_pending_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let (steps, db) = steps(config_in(dir.path(), 7));
    steps.init_db().await.unwrap();
    let first = db
      .get()
      .unwrap()
      .enqueue_task(&serde_json::json!({ "pole": 1 }))
      .unwrap();
    db.get()
      .unwrap()
      .enqueue_task(&serde_json::json!({ "pole": 2 }))
      .unwrap();

    steps.init_store().await.unwrap();

    let snapshot = steps.snapshot().unwrap();
    assert_eq!(snapshot.pending, 2);
    assert_eq!(snapshot.oldest_pending, Some(first.created_at));
  }
}
