use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Upstream origin every request is forwarded to
  pub origin: Option<String>,
  pub listen: SocketAddr,
  /// Where databases, logs and offline files live (defaults to the XDG data dir)
  pub data_dir: Option<PathBuf>,
  pub cache: CacheConfig,
  pub network: NetworkConfig,
  pub sync: SyncConfig,
  pub files: FilesConfig,
  pub logging: LoggingConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: None,
      listen: SocketAddr::from(([127, 0, 0, 1], 8787)),
      data_dir: None,
      cache: CacheConfig::default(),
      network: NetworkConfig::default(),
      sync: SyncConfig::default(),
      files: FilesConfig::default(),
      logging: LoggingConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
  #[default]
  Sqlite,
  /// Nothing survives a restart
  Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub backend: CacheBackend,
  pub prefix: String,
  /// Bump to retire every generation of the previous version on activation
  pub version: String,
  pub api_prefix: String,
  pub navigation_routes: Vec<String>,
  /// Paths fetched into the app-shell generation on install
  pub app_shell: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      backend: CacheBackend::default(),
      prefix: "fibrefield".to_string(),
      version: "v1".to_string(),
      api_prefix: "/api/".to_string(),
      navigation_routes: ["/dashboard", "/capture", "/assignments", "/sync", "/offline"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
      app_shell: ["/", "/icons/icon-192x192.png", "/manifest.json", "/sw.js"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
  /// How often the origin is checked to detect connectivity coming back
  pub heartbeat_interval_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: 15,
      heartbeat_interval_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub interval_secs: u64,
  /// Origin path offline actions are POSTed to
  pub endpoint: String,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: 300,
      endpoint: "/api/sync".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
  /// Offline-cached files (defaults to `<data_dir>/files`)
  pub dir: Option<PathBuf>,
  pub retention_days: u64,
}

impl Default for FilesConfig {
  fn default() -> Self {
    Self {
      dir: None,
      retention_days: 7,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter when RUST_LOG is unset
  pub level: String,
  /// Also write a daily-rolling log file under the data dir
  pub file: bool,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: true,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fibrefield.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fibrefield/config.yaml
  ///
  /// With no file found, defaults are used and settings must come from the
  /// command line.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("fibrefield.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fibrefield").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Check that every required setting is present and well formed.
  pub fn validate(&self) -> Result<()> {
    self.origin_url()?;

    if !self.cache.api_prefix.starts_with('/') {
      return Err(eyre!(
        "cache.api_prefix must start with '/', got '{}'",
        self.cache.api_prefix
      ));
    }
    if self.cache.version.trim().is_empty() {
      return Err(eyre!("cache.version must not be empty"));
    }
    if let Some(route) = self
      .cache
      .navigation_routes
      .iter()
      .chain(&self.cache.app_shell)
      .find(|r| !r.starts_with('/'))
    {
      return Err(eyre!("Route '{}' must start with '/'", route));
    }
    if self.sync.interval_secs == 0 {
      return Err(eyre!("sync.interval_secs must be greater than zero"));
    }
    if self.network.timeout_secs == 0 || self.network.heartbeat_interval_secs == 0 {
      return Err(eyre!("network timeouts and intervals must be greater than zero"));
    }
    self.sync_endpoint()?;
    Ok(())
  }

  /// Parsed upstream origin.
  pub fn origin_url(&self) -> Result<Url> {
    let raw = self
      .origin
      .as_deref()
      .ok_or_else(|| eyre!("No origin configured. Set `origin` in the config file or pass --origin."))?;

    let url = Url::parse(raw).map_err(|e| eyre!("Invalid origin '{}': {}", raw, e))?;
    if !matches!(url.scheme(), "http" | "https") {
      return Err(eyre!("Origin must be http or https, got '{}'", raw));
    }
    Ok(url)
  }

  pub fn sync_endpoint(&self) -> Result<Url> {
    self
      .origin_url()?
      .join(&self.sync.endpoint)
      .map_err(|e| eyre!("Invalid sync.endpoint '{}': {}", self.sync.endpoint, e))
  }

  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("fibrefield"))
  }

  pub fn cache_db_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("cache.db"))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("offline.db"))
  }

  pub fn files_dir(&self) -> Result<PathBuf> {
    match &self.files.dir {
      Some(dir) => Ok(dir.clone()),
      None => Ok(self.data_dir()?.join("files")),
    }
  }

  pub fn sync_interval(&self) -> Duration {
    Duration::from_secs(self.sync.interval_secs)
  }

  pub fn file_retention(&self) -> Duration {
    Duration::from_secs(self.files.retention_days * 24 * 60 * 60)
  }
}
