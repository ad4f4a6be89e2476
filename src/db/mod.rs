pub mod schema;
mod store;

pub use store::{HttpSyncTransport, SqliteOfflineStore};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::sync::{SyncStatus, SyncTask};

/// Local persistent database for offline data
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at `path`
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  #[cfg(test)]
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Get exclusive access to the connection
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Record an action taken while offline.
  pub fn enqueue_task(&self, payload: &Value) -> Result<SyncTask> {
    // Stored at microsecond precision
    let created_at = Utc::now().trunc_subsecs(6);
    // Fixed width so text ordering matches time ordering
    let stamp = created_at.to_rfc3339_opts(SecondsFormat::Micros, true);
    let body =
      serde_json::to_string(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hasher.update(stamp.as_bytes());
    let id = hex::encode(&hasher.finalize()[..12]);

    self
      .conn()?
      .execute(
        "INSERT INTO sync_tasks (id, payload, status, created_at) VALUES (?, ?, ?, ?)",
        params![id, body, SyncStatus::Pending.as_str(), stamp],
      )
      .map_err(|e| eyre!("Failed to record sync task: {}", e))?;

    Ok(SyncTask {
      id,
      payload: payload.clone(),
      status: SyncStatus::Pending,
      created_at,
    })
  }

  /// Pending tasks, oldest first.
  pub fn pending_tasks(&self) -> Result<Vec<SyncTask>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, payload, status, created_at FROM sync_tasks
         WHERE status = ?
         ORDER BY created_at, rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![SyncStatus::Pending.as_str()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| eyre!("Failed to query sync tasks: {}", e))?
      .collect::<rusqlite::Result<Vec<(String, String, String, String)>>>()
      .map_err(|e| eyre!("Failed to read sync task: {}", e))?;

    rows.into_iter().map(decode_task).collect()
  }

  #[cfg(test)]
  pub fn task(&self, id: &str) -> Result<Option<SyncTask>> {
    let conn = self.conn()?;
    let row = conn
      .query_row(
        "SELECT id, payload, status, created_at FROM sync_tasks WHERE id = ?",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query sync task {}: {}", id, e))?;

    row.map(decode_task).transpose()
  }

  /// Flip a task to synced. Already-synced tasks are left alone.
  pub fn mark_synced(&self, id: &str) -> Result<()> {
    let conn = self.conn()?;
    let updated = conn
      .execute(
        "UPDATE sync_tasks SET status = ?, synced_at = ? WHERE id = ? AND status = ?",
        params![
          SyncStatus::Synced.as_str(),
          Utc::now().to_rfc3339(),
          id,
          SyncStatus::Pending.as_str()
        ],
      )
      .map_err(|e| eyre!("Failed to mark sync task {}: {}", id, e))?;

    if updated == 0 {
      let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM sync_tasks WHERE id = ?", params![id], |row| {
          row.get(0)
        })
        .optional()
        .map_err(|e| eyre!("Failed to query sync task {}: {}", id, e))?;
      if exists.is_none() {
        return Err(eyre!("Unknown sync task {}", id));
      }
    }
    Ok(())
  }
}

fn decode_task(
  (id, payload, status, created_at): (String, String, String, String),
) -> Result<SyncTask> {
  let payload = serde_json::from_str(&payload)
    .map_err(|e| eyre!("Failed to parse payload of sync task {}: {}", id, e))?;
  let status =
    SyncStatus::parse(&status).ok_or_else(|| eyre!("Unknown status '{}' for {}", status, id))?;
  let created_at = DateTime::parse_from_rfc3339(&created_at)
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", created_at, e))?
    .with_timezone(&Utc);

  Ok(SyncTask {
    id,
    payload,
    status,
    created_at,
  })
}

/// Holder for the database once bootstrap has opened it.
///
/// Everything that needs local data goes through here, so nothing can touch
/// the database before it exists.
#[derive(Default)]
pub struct DatabaseSlot {
  inner: RwLock<Option<Arc<Database>>>,
}

impl DatabaseSlot {
  pub fn set(&self, db: Database) -> Result<()> {
    let mut inner = self
      .inner
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *inner = Some(Arc::new(db));
    Ok(())
  }

  pub fn get(&self) -> Result<Arc<Database>> {
    self
      .inner
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .clone()
      .ok_or_else(|| eyre!("Local database is not initialised"))
  }

  pub fn clear(&self) {
    if let Ok(mut inner) = self.inner.write() {
      *inner = None;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_enqueue_then_pending_in_order() {
    let db = Database::in_memory().unwrap();
    let first = db.enqueue_task(&json!({ "pole": 1 })).unwrap();
    let second = db.enqueue_task(&json!({ "pole": 2 })).unwrap();
    assert_ne!(first.id, second.id);

    let pending = db.pending_tasks().unwrap();
    assert_eq!(
      pending.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
      vec![first.id.as_str(), second.id.as_str()]
    );
    assert_eq!(pending[0].payload, json!({ "pole": 1 }));
  }

  #[test]
  fn test_mark_synced_is_monotonic() {
    let db = Database::in_memory().unwrap();
    let task = db.enqueue_task(&json!({ "pole": 1 })).unwrap();

    db.mark_synced(&task.id).unwrap();
    db.mark_synced(&task.id).unwrap();

    assert_eq!(db.task(&task.id).unwrap().unwrap().status, SyncStatus::Synced);
    assert!(db.pending_tasks().unwrap().is_empty());
    assert!(db.mark_synced("missing").is_err());
  }

  #[test]
  fn test_slot_requires_init() {
    let slot = DatabaseSlot::default();
    assert!(slot.get().is_err());
    slot.set(Database::in_memory().unwrap()).unwrap();
    assert!(slot.get().is_ok());
    slot.clear();
    assert!(slot.get().is_err());
  }
}
