use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::PartitionNames;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Shown as the notification title when a push payload has none
  pub app_name: String,
  /// Origin the storefront is served from; relative URLs resolve against it
  pub origin: String,
  /// Prefix for partition names
  pub cache_prefix: String,
  /// Deployment version; changing it retires every older partition
  pub cache_version: String,
  /// Override for the cache database location
  pub storage_path: Option<PathBuf>,
  pub routes: RoutesConfig,
  pub notifications: NotificationsConfig,
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// Paths under this prefix use the API strategy
  pub api_prefix: String,
  /// API path prefixes that answer `{ offline: true, data: [] }` when offline
  pub offline_tolerant: Vec<String>,
  /// API path prefixes whose failed mutations are staged for replay
  pub sync_eligible: Vec<String>,
  /// Reserved page served when a navigation cannot be satisfied
  pub offline_page: String,
  /// Assets fetched into the static partition at install
  pub precache: Vec<String>,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      api_prefix: "/api/".to_string(),
      offline_tolerant: vec![
        "/api/products".to_string(),
        "/api/categories".to_string(),
        "/api/cart".to_string(),
        "/api/orders".to_string(),
      ],
      sync_eligible: vec!["/api/cart".to_string(), "/api/wishlist".to_string()],
      offline_page: "/offline".to_string(),
      precache: vec![
        "/".to_string(),
        "/offline".to_string(),
        "/manifest.json".to_string(),
      ],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
}

impl Default for NotificationsConfig {
  fn default() -> Self {
    Self {
      icon: "/icons/icon-192x192.png".to_string(),
      badge: "/icons/badge-72x72.png".to_string(),
      vibrate: vec![100, 50, 100],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Tag under which failed mutations are registered
  pub mutation_tag: String,
  /// Drop a staged task after this many failed replays. Unset retries forever.
  pub max_attempts: Option<u32>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      mutation_tag: "cart-sync".to_string(),
      max_attempts: None,
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      app_name: "Storefront".to_string(),
      origin: "http://localhost:3000".to_string(),
      cache_prefix: "storefront".to_string(),
      cache_version: "v1".to_string(),
      storage_path: None,
      routes: RoutesConfig::default(),
      notifications: NotificationsConfig::default(),
      sync: SyncConfig::default(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./storefront-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/storefront-sw/config.yaml
  ///
  /// Falls back to defaults when nothing is found.
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
    let local = PathBuf::from("storefront-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("storefront-sw").join("config.yaml");
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

  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    if !self.routes.api_prefix.starts_with('/') {
      return Err(eyre!(
        "routes.api_prefix must start with '/': {}",
        self.routes.api_prefix
      ));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  pub fn partition_names(&self) -> PartitionNames {
    PartitionNames::new(&self.cache_prefix, &self.cache_version)
  }

  /// Database location: explicit override or the per-user data directory.
  pub fn storage_path(&self) -> Result<PathBuf> {
    match &self.storage_path {
      Some(path) => Ok(path.clone()),
      None => crate::cache::SqliteStorage::default_path(),
    }
  }
}
