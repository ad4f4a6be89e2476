//! Cache generation naming.

use serde::Serialize;

/// What a cache generation holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePurpose {
  AppShell,
  StaticAssets,
  Images,
  ApiResponses,
}

impl CachePurpose {
  pub const ALL: [CachePurpose; 4] = [
    CachePurpose::AppShell,
    CachePurpose::StaticAssets,
    CachePurpose::Images,
    CachePurpose::ApiResponses,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::AppShell => "app-shell",
      Self::StaticAssets => "static",
      Self::Images => "images",
      Self::ApiResponses => "api",
    }
  }
}

/// A named, versioned cache bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheGeneration {
  pub name: String,
  pub purpose: CachePurpose,
}

/// The set of generations the running version considers current.
///
/// Built once at startup and shared; every component that needs a cache name
/// asks this instead of hard-coding one.
#[derive(Debug, Clone)]
pub struct CacheNames {
  version: String,
  generations: Vec<CacheGeneration>,
}

impl CacheNames {
  /// Names take the form `<prefix>-<purpose>-<version>`.
  pub fn new(prefix: &str, version: &str) -> Self {
    let generations = CachePurpose::ALL
      .iter()
      .map(|&purpose| CacheGeneration {
        name: format!("{}-{}-{}", prefix, purpose.as_str(), version),
        purpose,
      })
      .collect();

    Self {
      version: version.to_string(),
      generations,
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Name of the active generation for a purpose.
  pub fn name(&self, purpose: CachePurpose) -> &str {
    self
      .generations
      .iter()
      .find(|g| g.purpose == purpose)
      .map(|g| g.name.as_str())
      // Every purpose is populated in `new`
      .unwrap_or_default()
  }

  pub fn generations(&self) -> &[CacheGeneration] {
    &self.generations
  }

  pub fn is_valid(&self, name: &str) -> bool {
    self.generations.iter().any(|g| g.name == name)
  }

  #[cfg(test)]
  pub fn valid_names(&self) -> Vec<&str> {
    self.generations.iter().map(|g| g.name.as_str()).collect()
  }
}
