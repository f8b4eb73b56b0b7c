use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ayon::DEFAULT_ACTIVITY_FILTERS;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub activity: ActivityConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// Server base url, e.g. `https://ayon.example.com` or `https://host/ayon`
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

impl ServerConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// How long a result nobody subscribes to survives garbage collection
  #[serde(default = "default_keep_unused_for_secs")]
  pub keep_unused_for_secs: u64,
}

fn default_keep_unused_for_secs() -> u64 {
  60
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      keep_unused_for_secs: default_keep_unused_for_secs(),
    }
  }
}

impl CacheConfig {
  pub fn keep_unused_for(&self) -> Duration {
    Duration::from_secs(self.keep_unused_for_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivityConfig {
  /// Feed filters refreshed after an activity changes (case-insensitive)
  #[serde(default = "default_filters", deserialize_with = "deserialize_lowercase")]
  pub filters: Vec<String>,
}

fn default_filters() -> Vec<String> {
  DEFAULT_ACTIVITY_FILTERS.iter().map(|f| f.to_string()).collect()
}

fn deserialize_lowercase<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

impl Default for ActivityConfig {
  fn default() -> Self {
    Self {
      filters: default_filters(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// Log file (defaults to $XDG_DATA_HOME/ayon-sync/ayon-sync.log)
  pub file: Option<PathBuf>,
}

impl LogConfig {
  pub fn path(&self) -> Option<PathBuf> {
    self
      .file
      .clone()
      .or_else(|| dirs::data_dir().map(|d| d.join("ayon-sync").join("ayon-sync.log")))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ayon-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ayon-sync/config.yaml
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
        "No configuration file found. Create one at ~/.config/ayon-sync/config.yaml\n\
                 with at least `server: {{ url: ... }}`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("ayon-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ayon-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.server.url.trim().is_empty() {
      return Err(eyre!("server.url must not be empty"));
    }
    Ok(config)
  }

  /// Get the AYON API key from environment variables.
  ///
  /// Checks AYON_SYNC_API_KEY first, then AYON_API_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("AYON_SYNC_API_KEY")
      .or_else(|_| std::env::var("AYON_API_KEY"))
      .map_err(|_| {
        eyre!(
          "AYON API key not found. Set AYON_SYNC_API_KEY or AYON_API_KEY environment variable."
        )
      })
  }
}
