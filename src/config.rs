use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  /// Where queue/cache/log databases and blobs live
  /// (defaults to the platform data dir).
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub sync: SyncSettings,
  #[serde(default)]
  pub logs: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  pub url: String,
  /// Batch log endpoint path
  #[serde(default = "default_log_path")]
  pub log_path: String,
  /// Per-request timeout, shared by live calls and replays
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
  /// Failed replay attempts before an entry is left stuck
  #[serde(default = "default_retry_cap")]
  pub retry_cap: u32,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      retry_cap: default_retry_cap(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
  /// Buffer size that triggers an early flush
  #[serde(default = "default_batch_size")]
  pub batch_size: u64,
  /// Wall-clock flush interval
  #[serde(default = "default_flush_interval_secs")]
  pub flush_interval_secs: u64,
  /// Platform tag attached to every record (e.g. "android", "ios")
  #[serde(default = "default_platform")]
  pub platform: String,
}

impl Default for LogSettings {
  fn default() -> Self {
    Self {
      batch_size: default_batch_size(),
      flush_interval_secs: default_flush_interval_secs(),
      platform: default_platform(),
    }
  }
}

fn default_log_path() -> String {
  "/logs/batch".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_retry_cap() -> u32 {
  3
}

fn default_batch_size() -> u64 {
  50
}

fn default_flush_interval_secs() -> u64 {
  60
}

fn default_platform() -> String {
  "unknown".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/offsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the bearer token attached to replayed and live requests.
  ///
  /// Checks OFFSYNC_API_TOKEN first, then API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("OFFSYNC_API_TOKEN")
      .or_else(|_| std::env::var("API_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set OFFSYNC_API_TOKEN or API_TOKEN environment variable.")
      })
  }

  /// Resolve the data directory for durable state.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offsync"))
  }
}
