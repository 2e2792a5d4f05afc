use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::scheduler::MAX_BACKOFF_SECS;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the worker is registered for; relative URLs resolve against it
  pub origin: Url,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub push: PushConfig,
  /// SQLite database path (defaults to $XDG_DATA_HOME/cityseva-sw/worker.db)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Cache name; bumping it invalidates every cached resource on activation
  pub version: String,
  /// Document served when neither network nor cache can answer
  pub offline_page: String,
  /// Resources pre-cached at install time
  pub manifest: Vec<String>,
  /// Requests whose URL contains any of these are never intercepted
  pub bypass_paths: Vec<String>,
  /// Requests to these hosts are never intercepted
  pub bypass_hosts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub tag: String,
  /// Backend endpoint queued complaints are re-submitted to
  pub endpoint: String,
  pub max_attempts: u32,
  pub initial_backoff_secs: u64,
  pub backoff_multiplier: u32,
  /// How often the connectivity monitor probes the origin
  pub probe_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
  pub default_title: String,
  /// Body used when a push arrives without any payload
  pub fallback_body: String,
  pub default_url: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://127.0.0.1:5000/").expect("static origin URL"),
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
      push: PushConfig::default(),
      database: None,
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    let manifest = [
      "/",
      "/static/offline.html",
      "/static/css/styles.css",
      "/static/js/scripts.js",
      "/static/img/favicon.svg",
      "/static/img/favicon.ico",
      "/static/img/icon-192.png",
      "/static/img/icon-512.png",
      "/citizen/dashboard",
      "/citizen/complaints",
      "/citizen/notifications",
      "/citizen/profile",
      "/static/js/service-worker.js",
      "https://cdn.jsdelivr.net/npm/bootstrap@5.3.0/dist/css/bootstrap.min.css",
      "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.0.0/css/all.min.css",
      "https://fonts.googleapis.com/css2?family=Inter:wght@400;500;600;700&display=swap",
      "https://cdn.jsdelivr.net/npm/bootstrap@5.3.0/dist/js/bootstrap.bundle.min.js",
      "https://code.jquery.com/jquery-3.6.0.min.js",
      "https://cdn.jsdelivr.net/npm/chart.js",
    ];

    Self {
      version: "cityseva-v1".to_string(),
      offline_page: "/static/offline.html".to_string(),
      manifest: manifest.iter().map(|s| s.to_string()).collect(),
      bypass_paths: vec!["/api/".to_string()],
      bypass_hosts: vec!["maps.googleapis.com".to_string()],
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "sync-complaints".to_string(),
      endpoint: "/api/complaints".to_string(),
      max_attempts: 3,
      initial_backoff_secs: 300,
      backoff_multiplier: 3,
      probe_interval_secs: 30,
    }
  }
}

impl Default for PushConfig {
  fn default() -> Self {
    Self {
      default_title: "CitySeva Notification".to_string(),
      fallback_body: "New update available".to_string(),
      default_url: "/".to_string(),
      icon: "/static/img/icon-192.png".to_string(),
      badge: "/static/img/notification-badge.png".to_string(),
      vibrate: vec![100, 50, 100],
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./cityseva-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/cityseva-sw/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("cityseva-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("cityseva-sw").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Check the invariants the worker relies on.
  pub fn validate(&self) -> Result<()> {
    if self.cache.version.trim().is_empty() {
      return Err(eyre!("cache.version must not be empty"));
    }

    // The offline page is only ever served from the cache
    if !self.cache.manifest.contains(&self.cache.offline_page) {
      return Err(eyre!(
        "cache.manifest must contain the offline page {}",
        self.cache.offline_page
      ));
    }

    if self.sync.max_attempts == 0 {
      return Err(eyre!("sync.max_attempts must be at least 1"));
    }

    if self.sync.initial_backoff_secs == 0 || self.sync.initial_backoff_secs > MAX_BACKOFF_SECS {
      return Err(eyre!(
        "sync.initial_backoff_secs must be between 1 and {}",
        MAX_BACKOFF_SECS
      ));
    }

    for entry in &self.cache.manifest {
      self.resolve(entry)?;
    }

    Ok(())
  }

  /// Resolve a possibly relative URL against the worker origin.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    self
      .origin
      .join(url)
      .map_err(|e| eyre!("Invalid URL {}: {}", url, e))
  }

  /// Database location, honoring an explicit override.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }
    Ok(data_dir()?.join("worker.db"))
  }
}

/// Per-user data directory for the worker.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("cityseva-sw"))
}
