//! Application configuration with persistence.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::api::Quality;

/// Environment variable that overrides [`AppConfig::api_base`].
pub const API_ENV: &str = "CAPTURE_DECK_API";

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read {path:?}: {source}")]
  Read {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("Failed to parse {path:?}: {source}")]
  Parse {
    path: PathBuf,
    source: serde_json::Error,
  },
  #[error("Invalid configuration: {0}")]
  Invalid(String),
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
  /// Capture server origin, e.g. `http://nas:8000`.
  #[serde(default = "default_api_base")]
  pub api_base: String,

  #[serde(default = "default_task_interval")]
  pub task_interval_ms: u64,

  #[serde(default = "default_recordings_interval")]
  pub recordings_interval_ms: u64,

  #[serde(default = "default_logs_interval")]
  pub logs_interval_ms: u64,

  #[serde(default = "default_conversion_interval")]
  pub conversion_interval_ms: u64,

  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,

  #[serde(default)]
  pub default_quality: Quality,

  /// Custom MPV executable path (None = auto-detect).
  #[serde(default)]
  pub mpv_path: Option<String>,

  /// Additional MPV command-line arguments.
  #[serde(default)]
  pub mpv_args: Vec<String>,
}

fn default_api_base() -> String {
  "http://localhost:8000".to_string()
}

fn default_task_interval() -> u64 {
  10_000
}

fn default_recordings_interval() -> u64 {
  5_000
}

fn default_logs_interval() -> u64 {
  5_000
}

fn default_conversion_interval() -> u64 {
  2_000
}

fn default_request_timeout() -> u64 {
  10
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      api_base: default_api_base(),
      task_interval_ms: default_task_interval(),
      recordings_interval_ms: default_recordings_interval(),
      logs_interval_ms: default_logs_interval(),
      conversion_interval_ms: default_conversion_interval(),
      request_timeout_secs: default_request_timeout(),
      default_quality: Quality::default(),
      mpv_path: None,
      mpv_args: Vec::new(),
    }
  }
}

impl AppConfig {
  /// `<config_dir>/capture-deck/config.json`, if the platform has a config dir.
  pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("capture-deck").join("config.json"))
  }

  /// Load from the default location, falling back to defaults when the file is
  /// missing, then apply the environment override and validate.
  pub fn load() -> Result<Self, ConfigError> {
    let mut config = match Self::default_path() {
      Some(path) => Self::load_from(&path)?,
      None => {
        log::warn!("No config directory on this platform, using defaults");
        Self::default()
      }
    };
    if let Ok(api) = std::env::var(API_ENV) {
      config.apply_api_override(&api);
    }
    config.validate()?;
    Ok(config)
  }

  /// Read one config file. A missing file yields the defaults.
  pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
    let text = match std::fs::read_to_string(path) {
      Ok(text) => text,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        log::info!("No config at {:?}, using defaults", path);
        return Ok(Self::default());
      }
      Err(source) => {
        return Err(ConfigError::Read {
          path: path.to_path_buf(),
          source,
        })
      }
    };
    let config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    log::info!("Loaded config from {:?}", path);
    Ok(config)
  }

  fn apply_api_override(&mut self, api: &str) {
    let api = api.trim();
    if !api.is_empty() {
      log::info!("{} overrides apiBase: {}", API_ENV, api);
      self.api_base = api.to_string();
    }
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), ConfigError> {
    let base = self.api_base.trim();
    if !base.starts_with("http://") && !base.starts_with("https://") {
      return Err(ConfigError::Invalid(
        "apiBase must start with http:// or https://".to_string(),
      ));
    }
    let intervals = [
      ("taskIntervalMs", self.task_interval_ms),
      ("recordingsIntervalMs", self.recordings_interval_ms),
      ("logsIntervalMs", self.logs_interval_ms),
      ("conversionIntervalMs", self.conversion_interval_ms),
    ];
    for (name, ms) in intervals {
      if !(100..=600_000).contains(&ms) {
        return Err(ConfigError::Invalid(format!(
          "{} must be between 100 and 600000",
          name
        )));
      }
    }
    if self.request_timeout_secs == 0 || self.request_timeout_secs > 300 {
      return Err(ConfigError::Invalid(
        "requestTimeoutSecs must be between 1 and 300".to_string(),
      ));
    }
    Ok(())
  }

  pub fn task_interval(&self) -> Duration {
    Duration::from_millis(self.task_interval_ms)
  }

  pub fn recordings_interval(&self) -> Duration {
    Duration::from_millis(self.recordings_interval_ms)
  }

  pub fn logs_interval(&self) -> Duration {
    Duration::from_millis(self.logs_interval_ms)
  }

  pub fn conversion_interval(&self) -> Duration {
    Duration::from_millis(self.conversion_interval_ms)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  /// Configured MPV binary, ignoring an empty string.
  pub fn mpv_binary(&self) -> Option<PathBuf> {
    self
      .mpv_path
      .as_deref()
      .map(str::trim)
      .filter(|s| !s.is_empty())
      .map(PathBuf::from)
  }
}
