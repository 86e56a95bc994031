//! Engine pool error types.

use thiserror::Error;

use super::InstanceId;
use crate::config::ConfigError;
use crate::engine::{EngineError, EqualizerError, IpcError, ProcessError};

/// Errors surfaced by the engine pool.
#[derive(Debug, Error)]
pub enum PoolError {
  #[error("Engine error: {0}")]
  Engine(#[from] EngineError),

  #[error("Process error: {0}")]
  Process(#[from] ProcessError),

  #[error("IPC error: {0}")]
  Ipc(#[from] IpcError),

  #[error("Equalizer error: {0}")]
  Equalizer(#[from] EqualizerError),

  #[error("Config error: {0}")]
  Config(#[from] ConfigError),

  #[error("Unknown instance {0}")]
  UnknownInstance(InstanceId),

  #[error("Invalid volume: {0}")]
  InvalidVolume(f64),

  #[error("Engine pool is shut down")]
  ShutDown,
}

pub type Result<T> = std::result::Result<T, PoolError>;
