use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum BatchlogError {
  #[error("invalid configuration: {0}")]
  Config(#[from] ConfigError),

  /// A background thread could not be spawned, or a sink failed to open.
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("a global tracing subscriber is already installed")]
  SubscriberAlreadySet,
}
