//! # Config Module
//!
//! Process-wide settings, fixed when the aggregator is constructed.
//!
//! ```rust
//! use batchlog::config::Config;
//! use batchlog::unscoped::UnscopedMode;
//!
//! let config = Config::from_json_str(r#"{ "watch_timeout_secs": 30, "unscoped_mode": "batched" }"#)
//!   .unwrap();
//!
//! assert_eq!(config.watch_timeout_secs, 30);
//! assert_eq!(config.unscoped_mode, UnscopedMode::Batched);
//! // unspecified settings keep their defaults
//! assert_eq!(config.unscoped_interval_ms, 500);
//! ```


use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flush::ShutdownPolicy;
use crate::unscoped::UnscopedMode;

pub const DEFAULT_WATCH_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_UNSCOPED_INTERVAL_MS: u64 = 500;
pub const DEFAULT_FLUSH_WORKERS: usize = 1;
pub const MAX_FLUSH_WORKERS: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("watch_timeout_secs must be at least 1")]
  ZeroWatchTimeout,

  #[error("unscoped_interval_ms must be at least 1 in batched mode")]
  ZeroUnscopedInterval,

  #[error("flush_workers must be between 1 and {max}, got {got}")]
  FlushWorkers { got: usize, max: usize },

  #[error("failed to read config file: {0}")]
  Io(#[from] std::io::Error),

  #[error("failed to parse config: {0}")]
  Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Windows open longer than this are force-flushed by the watchdog. Also
  /// the watchdog's scan interval.
  pub watch_timeout_secs: u64,

  pub unscoped_mode: UnscopedMode,

  /// Drain interval for [`UnscopedMode::Batched`].
  pub unscoped_interval_ms: u64,

  pub flush_workers: usize,

  pub shutdown_policy: ShutdownPolicy,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      watch_timeout_secs: DEFAULT_WATCH_TIMEOUT_SECS,
      unscoped_mode: UnscopedMode::Immediate,
      unscoped_interval_ms: DEFAULT_UNSCOPED_INTERVAL_MS,
      flush_workers: DEFAULT_FLUSH_WORKERS,
      shutdown_policy: ShutdownPolicy::Drain,
    }
  }
}

impl Config {
  pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
    let config: Config = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
  }

  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Self::from_json_str(&contents)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.watch_timeout_secs == 0 {
      return Err(ConfigError::ZeroWatchTimeout);
    }
    if self.unscoped_mode == UnscopedMode::Batched && self.unscoped_interval_ms == 0 {
      return Err(ConfigError::ZeroUnscopedInterval);
    }
    if self.flush_workers == 0 || self.flush_workers > MAX_FLUSH_WORKERS {
      return Err(ConfigError::FlushWorkers {
        got: self.flush_workers,
        max: MAX_FLUSH_WORKERS,
      });
    }
    Ok(())
  }

  pub fn watch_timeout(&self) -> Duration {
    Duration::from_secs(self.watch_timeout_secs)
  }

  pub fn unscoped_interval(&self) -> Duration {
    Duration::from_millis(self.unscoped_interval_ms)
  }

  pub fn with_watch_timeout_secs(mut self, secs: u64) -> Self {
    self.watch_timeout_secs = secs;
    self
  }

  pub fn with_unscoped_mode(mut self, mode: UnscopedMode) -> Self {
    self.unscoped_mode = mode;
    self
  }

  pub fn with_unscoped_interval_ms(mut self, ms: u64) -> Self {
    self.unscoped_interval_ms = ms;
    self
  }

  pub fn with_flush_workers(mut self, workers: usize) -> Self {
    self.flush_workers = workers;
    self
  }

  pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
    self.shutdown_policy = policy;
    self
  }
}
