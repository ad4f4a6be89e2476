//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};

/// Snapshot of a response as it was received (or synthesized).
///
/// Entries are immutable once written: a newer snapshot replaces the old one
/// wholesale, nothing is ever patched in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  /// When the fetch that produced this snapshot was issued.
  pub stored_at: DateTime<Utc>,
}

impl StoredResponse {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
    Self {
      status,
      headers,
      body,
      stored_at: Utc::now(),
    }
  }

  /// A plain-text response produced locally instead of by the origin.
  pub fn synthesized(status: u16, body: &str) -> Self {
    Self::new(
      status,
      vec![(
        "content-type".to_string(),
        "text/plain; charset=utf-8".to_string(),
      )],
      body.as_bytes().to_vec(),
    )
  }

  /// 503 served when the network is unreachable and nothing is cached.
  pub fn offline() -> Self {
    Self::synthesized(503, "Offline")
  }

  /// 404 served by cache-only lookups that miss.
  pub fn not_found() -> Self {
    Self::synthesized(404, "Not found")
  }

  pub fn with_stored_at(mut self, stored_at: DateTime<Utc>) -> Self {
    self.stored_at = stored_at;
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup.
  #[cfg(test)]
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(key, _)| key.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }
}

/// A response together with where it came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: StoredResponse,
  pub source: CacheSource,
}

impl Served {
  pub fn from_network(response: StoredResponse) -> Self {
    Self {
      response,
      source: CacheSource::Network,
    }
  }

  pub fn from_cache(response: StoredResponse) -> Self {
    Self {
      response,
      source: CacheSource::Cache,
    }
  }

  pub fn synthesized(response: StoredResponse) -> Self {
    Self {
      response,
      source: CacheSource::Synthesized,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from the origin
  Network,
  /// A stored snapshot, possibly stale
  Cache,
  /// Built locally because neither the origin nor the cache could answer
  Synthesized,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Synthesized => "synthesized",
    }
  }
}

/// Trait for cache storage backends.
///
/// Mirrors the host cache API: named generations, each mapping a request key
/// to a stored response. Implementations must tolerate concurrent readers
/// and concurrent last-writer-wins writers.
pub trait CacheStorage: Send + Sync {
  /// Ensure a generation with this name exists.
  fn open(&self, name: &str) -> Result<()>;

  /// Look up a request key within one generation.
  fn match_in(&self, name: &str, key: &str) -> Result<Option<StoredResponse>>;

  /// Look up a request key across every generation, oldest generation first.
  fn match_any(&self, key: &str) -> Result<Option<StoredResponse>>;

  /// Store a response, creating the generation if needed.
  ///
  /// A write older than the entry already stored (by `stored_at`) is dropped.
  fn put(&self, name: &str, key: &str, response: &StoredResponse) -> Result<()>;

  /// Delete a whole generation. Returns whether it existed.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Names of every generation present.
  fn keys(&self) -> Result<Vec<String>>;
}
