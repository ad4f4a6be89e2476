//! Cache storage backends: SQLite for the running proxy, memory for tests.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheStorage, StoredResponse};

/// Storage implementation that keeps every generation in memory.
///
/// Generations are kept in creation order so `match_any` behaves like the
/// SQLite backend.
#[derive(Default)]
pub struct MemoryStorage {
  generations: Mutex<Vec<(String, Vec<(String, StoredResponse)>)>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Vec<(String, Vec<(String, StoredResponse)>)>>> {
    self
      .generations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, name: &str) -> Result<()> {
    let mut generations = self.lock()?;
    if !generations.iter().any(|(n, _)| n == name) {
      generations.push((name.to_string(), Vec::new()));
    }
    Ok(())
  }

  fn match_in(&self, name: &str, key: &str) -> Result<Option<StoredResponse>> {
    let generations = self.lock()?;
    Ok(
      generations
        .iter()
        .find(|(n, _)| n == name)
        .and_then(|(_, entries)| entries.iter().find(|(k, _)| k == key))
        .map(|(_, response)| response.clone()),
    )
  }

  fn match_any(&self, key: &str) -> Result<Option<StoredResponse>> {
    let generations = self.lock()?;
    Ok(
      generations
        .iter()
        .find_map(|(_, entries)| entries.iter().find(|(k, _)| k == key))
        .map(|(_, response)| response.clone()),
    )
  }

  fn put(&self, name: &str, key: &str, response: &StoredResponse) -> Result<()> {
    let mut generations = self.lock()?;
    let index = match generations.iter().position(|(n, _)| n == name) {
      Some(index) => index,
      None => {
        generations.push((name.to_string(), Vec::new()));
        generations.len() - 1
      }
    };
    let entries = &mut generations[index].1;

    match entries.iter_mut().find(|(k, _)| k == key) {
      Some((_, existing)) => {
        if response.stored_at >= existing.stored_at {
          *existing = response.clone();
        }
      }
      None => entries.push((key.to_string(), response.clone())),
    }
    Ok(())
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut generations = self.lock()?;
    let before = generations.len();
    generations.retain(|(n, _)| n != name);
    Ok(generations.len() != before)
  }

  fn keys(&self) -> Result<Vec<String>> {
    let generations = self.lock()?;
    Ok(generations.iter().map(|(n, _)| n.clone()).collect())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Cache database that lives only as long as the process.
  #[cfg(test)]
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per cache generation, rowid gives creation order
CREATE TABLE IF NOT EXISTS cache_generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored response snapshots
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    PRIMARY KEY (generation, request_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_key ON cache_entries(request_key);
"#;

/// Raw row as read from `cache_entries`.
type EntryRow = (u16, String, Vec<u8>, i64);

fn decode_entry((status, headers, body, stored_at): EntryRow) -> Result<StoredResponse> {
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
  let stored_at = DateTime::<Utc>::from_timestamp_micros(stored_at)
    .ok_or_else(|| eyre!("Invalid cached timestamp {}", stored_at))?;

  Ok(StoredResponse {
    status,
    headers,
    body,
    stored_at,
  })
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;
    Ok(())
  }

  fn match_in(&self, name: &str, key: &str) -> Result<Option<StoredResponse>> {
    let conn = self.lock()?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM cache_entries
         WHERE generation = ? AND request_key = ?",
        params![name, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache {}: {}", name, e))?;

    row.map(decode_entry).transpose()
  }

  fn match_any(&self, key: &str) -> Result<Option<StoredResponse>> {
    let conn = self.lock()?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT e.status, e.headers, e.body, e.stored_at FROM cache_entries e
         INNER JOIN cache_generations g ON g.name = e.generation
         WHERE e.request_key = ?
         ORDER BY g.rowid
         LIMIT 1",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query caches: {}", e))?;

    row.map(decode_entry).transpose()
  }

  fn put(&self, name: &str, key: &str, response: &StoredResponse) -> Result<()> {
    let mut conn = self.lock()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;

    // Older snapshots never replace newer ones
    tx.execute(
      "INSERT INTO cache_entries (generation, request_key, status, headers, body, stored_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6)
       ON CONFLICT(generation, request_key) DO UPDATE SET
         status = excluded.status,
         headers = excluded.headers,
         body = excluded.body,
         stored_at = excluded.stored_at
       WHERE excluded.stored_at >= cache_entries.stored_at",
      params![
        name,
        key,
        response.status,
        headers,
        response.body,
        response.stored_at.timestamp_micros()
      ],
    )
    .map_err(|e| eyre!("Failed to store response in {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute(
        "DELETE FROM cache_generations WHERE name = ?",
        params![name],
      )
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_generations ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }
}
