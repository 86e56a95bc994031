//! Application configuration with persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{Equalizer, HandshakeSettings, PortRange};
use crate::pool::{PlaybackTimings, TerminationPolicy};

const CONFIG_DIR: &str = "masss";
const CONFIG_FILE: &str = "config.json";

/// Highest master volume accepted (125%).
pub const MAX_MASTER_VOLUME: f64 = 1.25;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
  #[error("Invalid configuration: {0}")]
  Invalid(String),
  #[error("No configuration directory on this platform")]
  NoConfigDir,
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
  /// Custom engine executable path (None = auto-detect).
  #[serde(default)]
  pub engine_path: Option<String>,

  /// Working directory for engine processes.
  #[serde(default)]
  pub engine_working_dir: Option<String>,

  /// Additional engine command-line arguments.
  #[serde(default)]
  pub engine_args: Vec<String>,

  #[serde(default = "default_port_start")]
  pub port_start: u16,

  #[serde(default = "default_port_end")]
  pub port_end: u16,

  /// Ports tried before engine startup fails for good.
  #[serde(default = "default_max_port_attempts")]
  pub max_port_attempts: u32,

  #[serde(default = "default_connect_grace_ms")]
  pub connect_grace_ms: u64,

  #[serde(default = "default_connect_retries")]
  pub connect_retries: u32,

  #[serde(default = "default_connect_retry_interval_ms")]
  pub connect_retry_interval_ms: u64,

  #[serde(default = "default_seek_settle_ms")]
  pub seek_settle_ms: u64,

  #[serde(default = "default_length_query_delay_ms")]
  pub length_query_delay_ms: u64,

  #[serde(default = "default_response_timeout_ms")]
  pub response_timeout_ms: u64,

  #[serde(default = "default_auto_stop_margin_ms")]
  pub auto_stop_margin_ms: u64,

  /// Delay before recurring maintenance jobs run again.
  #[serde(default = "default_maintenance_interval_ms")]
  pub maintenance_interval_ms: u64,

  /// Master volume, 0.0 to 1.25.
  #[serde(default = "default_master_volume")]
  pub master_volume: f64,

  /// Ten space-separated band gains in dB.
  #[serde(default = "default_equalizer_bands")]
  pub equalizer_bands: String,

  #[serde(default = "default_equalizer_preamp")]
  pub equalizer_preamp: i32,

  /// Skip applied to every track instead of the per-file one.
  #[serde(default)]
  pub skip_override: Option<u32>,
}

fn default_port_start() -> u16 {
  8990
}

fn default_port_end() -> u16 {
  9089
}

fn default_max_port_attempts() -> u32 {
  99
}

fn default_connect_grace_ms() -> u64 {
  80
}

fn default_connect_retries() -> u32 {
  10
}

fn default_connect_retry_interval_ms() -> u64 {
  200
}

fn default_seek_settle_ms() -> u64 {
  100
}

fn default_length_query_delay_ms() -> u64 {
  20
}

fn default_response_timeout_ms() -> u64 {
  2000
}

fn default_auto_stop_margin_ms() -> u64 {
  500
}

fn default_maintenance_interval_ms() -> u64 {
  200
}

fn default_master_volume() -> f64 {
  0.5
}

fn default_equalizer_bands() -> String {
  "0 0 0 0 0 0 0 0 0 0".to_string()
}

fn default_equalizer_preamp() -> i32 {
  crate::engine::DEFAULT_PREAMP
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      engine_path: None,
      engine_working_dir: None,
      engine_args: Vec::new(),
      port_start: default_port_start(),
      port_end: default_port_end(),
      max_port_attempts: default_max_port_attempts(),
      connect_grace_ms: default_connect_grace_ms(),
      connect_retries: default_connect_retries(),
      connect_retry_interval_ms: default_connect_retry_interval_ms(),
      seek_settle_ms: default_seek_settle_ms(),
      length_query_delay_ms: default_length_query_delay_ms(),
      response_timeout_ms: default_response_timeout_ms(),
      auto_stop_margin_ms: default_auto_stop_margin_ms(),
      maintenance_interval_ms: default_maintenance_interval_ms(),
      master_volume: default_master_volume(),
      equalizer_bands: default_equalizer_bands(),
      equalizer_preamp: default_equalizer_preamp(),
      skip_override: None,
    }
  }
}

impl AppConfig {
  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if PortRange::new(self.port_start, self.port_end).is_none() {
      return Err(ConfigError::Invalid(format!(
        "Port range {}-{} is inverted",
        self.port_start, self.port_end
      )));
    }
    if self.max_port_attempts == 0 {
      return Err(ConfigError::Invalid(
        "Max port attempts must be at least 1".to_string(),
      ));
    }
    if self.connect_retries == 0 {
      return Err(ConfigError::Invalid(
        "Connect retries must be at least 1".to_string(),
      ));
    }
    if !(0.0..=MAX_MASTER_VOLUME).contains(&self.master_volume) {
      return Err(ConfigError::Invalid(format!(
        "Master volume must be between 0 and {}",
        MAX_MASTER_VOLUME
      )));
    }
    if let Err(e) = Equalizer::parse(&self.equalizer_bands, self.equalizer_preamp) {
      return Err(ConfigError::Invalid(format!("Equalizer: {}", e)));
    }
    if self.response_timeout_ms == 0 {
      return Err(ConfigError::Invalid(
        "Response timeout must be positive".to_string(),
      ));
    }
    Ok(())
  }

  /// Default location: `<config dir>/masss/config.json`.
  pub fn default_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
      .map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
      .ok_or(ConfigError::NoConfigDir)
  }

  /// Load from `path`, falling back to defaults when missing or unusable.
  pub fn load(path: &Path) -> Self {
    let raw = match std::fs::read_to_string(path) {
      Ok(raw) => raw,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        log::info!("No config at {:?}, using defaults", path);
        return Self::default();
      }
      Err(e) => {
        log::warn!("Failed to read config {:?}: {}", path, e);
        return Self::default();
      }
    };

    match serde_json::from_str::<AppConfig>(&raw) {
      Ok(config) => match config.validate() {
        Ok(()) => {
          log::info!("Loaded config from {:?}", path);
          config
        }
        Err(e) => {
          log::warn!("Ignoring invalid config {:?}: {}", path, e);
          Self::default()
        }
      },
      Err(e) => {
        log::warn!("Failed to parse config {:?}: {}", path, e);
        Self::default()
      }
    }
  }

  pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(self)?;
    std::fs::write(path, json)?;
    log::info!("Saved config to {:?}", path);
    Ok(())
  }

  /// Runtime settings for the engine pool.
  pub fn pool_config(&self) -> Result<PoolConfig, ConfigError> {
    self.validate()?;
    let ports = PortRange::new(self.port_start, self.port_end)
      .ok_or_else(|| ConfigError::Invalid("Port range is inverted".to_string()))?;
    let equalizer = Equalizer::parse(&self.equalizer_bands, self.equalizer_preamp)
      .map_err(|e| ConfigError::Invalid(format!("Equalizer: {}", e)))?;

    Ok(PoolConfig {
      handshake: HandshakeSettings {
        ports,
        max_port_attempts: self.max_port_attempts,
        grace: Duration::from_millis(self.connect_grace_ms),
        connect_retries: self.connect_retries,
        connect_retry_interval: Duration::from_millis(self.connect_retry_interval_ms),
      },
      playback: PlaybackTimings {
        seek_settle: Duration::from_millis(self.seek_settle_ms),
        length_query_delay: Duration::from_millis(self.length_query_delay_ms),
        response_timeout: Duration::from_millis(self.response_timeout_ms),
        auto_stop_margin: Duration::from_millis(self.auto_stop_margin_ms),
      },
      termination: TerminationPolicy::default(),
      maintenance_interval: Duration::from_millis(self.maintenance_interval_ms),
      shutdown_steps: default_shutdown_steps(),
      master_volume: self.master_volume,
      equalizer,
      skip_override: self.skip_override,
    })
  }
}

/// Settings the engine pool runs with.
#[derive(Debug, Clone)]
pub struct PoolConfig {
  pub handshake: HandshakeSettings,
  pub playback: PlaybackTimings,
  pub termination: TerminationPolicy,
  pub maintenance_interval: Duration,
  /// Waits between termination checks during shutdown.
  pub shutdown_steps: Vec<Duration>,
  pub master_volume: f64,
  pub equalizer: Equalizer,
  pub skip_override: Option<u32>,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      handshake: HandshakeSettings::default(),
      playback: PlaybackTimings::default(),
      termination: TerminationPolicy::default(),
      maintenance_interval: Duration::from_millis(default_maintenance_interval_ms()),
      shutdown_steps: default_shutdown_steps(),
      master_volume: default_master_volume(),
      equalizer: Equalizer::default(),
      skip_override: None,
    }
  }
}

fn default_shutdown_steps() -> Vec<Duration> {
  vec![
    Duration::from_millis(50),
    Duration::from_millis(1500),
    Duration::from_secs(2),
    Duration::from_secs(2),
  ]
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_are_valid() {
    let config = AppConfig::default();
    assert!(config.validate().is_ok());

    let pool = config.pool_config().unwrap();
    assert_eq!(pool.handshake.ports, PortRange::default());
    assert_eq!(pool.handshake.max_port_attempts, 99);
    assert_eq!(pool.playback.auto_stop_margin, Duration::from_millis(500));
    assert_eq!(pool.shutdown_steps.len(), 4);
  }

  #[test]
  fn test_validation() {
    let mut config = AppConfig {
      port_start: 9000,
      port_end: 8000,
      ..AppConfig::default()
    };
    assert!(config.validate().is_err());

    config = AppConfig {
      master_volume: 1.5,
      ..AppConfig::default()
    };
    assert!(config.validate().is_err());

    config = AppConfig {
      equalizer_bands: "1 2 3".to_string(),
      ..AppConfig::default()
    };
    assert!(config.validate().is_err());

    config = AppConfig {
      connect_retries: 0,
      ..AppConfig::default()
    };
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    assert!(config.pool_config().is_err());
  }

  #[test]
  fn test_partial_json_uses_defaults() {
    let config: AppConfig =
      serde_json::from_str(r#"{"enginePath":"/opt/vlc","masterVolume":0.8}"#).unwrap();
    assert_eq!(config.engine_path.as_deref(), Some("/opt/vlc"));
    assert_eq!(config.master_volume, 0.8);
    assert_eq!(config.port_start, 8990);
    assert_eq!(config.connect_retries, 10);
  }

  #[test]
  fn test_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.json");

    let config = AppConfig {
      master_volume: 0.75,
      equalizer_bands: "1 0 0 0 0 0 0 0 0 -3".to_string(),
      skip_override: Some(4),
      ..AppConfig::default()
    };
    config.save(&path).unwrap();

    assert_eq!(AppConfig::load(&path), config);
  }

  #[test]
  fn test_load_falls_back_on_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert_eq!(AppConfig::load(&path), AppConfig::default());

    assert_eq!(
      AppConfig::load(&dir.path().join("missing.json")),
      AppConfig::default()
    );
  }
}
