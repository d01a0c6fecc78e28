use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::db::Database;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin of the application; only requests to this origin are cached
  pub origin: Url,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub lifecycle: LifecycleConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Version tag of the live cache generations; bump it to evict old caches
  pub version: String,
  /// Requests whose path starts with this prefix use the API strategy
  pub api_prefix: String,
  /// Served when a page or asset is unavailable from both network and cache
  pub offline_page: String,
  /// Served instead of images that cannot be fetched
  pub image_placeholder: Option<String>,
  /// App shell fetched at install time; every path must be fetchable
  pub precache: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      api_prefix: "/api/".to_string(),
      offline_page: "/offline.html".to_string(),
      image_placeholder: Some("/icons/icon-192.png".to_string()),
      precache: [
        "/",
        "/index.html",
        "/offline.html",
        "/styles.css",
        "/main.js",
        "/favicon.ico",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LifecycleConfig {
  /// Activate a freshly installed version without waiting for the old one to let go
  #[serde(default)]
  pub skip_waiting_on_install: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database file (default: $XDG_DATA_HOME/haven/haven.db)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./haven.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/haven/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/haven/config.yaml\n\
                 See haven.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("haven.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("haven").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;

    if !config.cache.api_prefix.starts_with('/') {
      return Err(eyre!(
        "cache.api_prefix must be root-relative, got {:?}",
        config.cache.api_prefix
      ));
    }
    if config.cache.version.trim().is_empty() {
      return Err(eyre!("cache.version must not be empty"));
    }

    Ok(config)
  }

  /// Database file, falling back to the platform data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(path) => Ok(path.clone()),
      None => Database::default_path(),
    }
  }

  /// Get the vault secret from the environment.
  ///
  /// Checks HAVEN_VAULT_SECRET.
  pub fn get_vault_secret() -> Result<String> {
    std::env::var("HAVEN_VAULT_SECRET")
      .map_err(|_| eyre!("Vault secret not found. Set HAVEN_VAULT_SECRET environment variable."))
  }
}
