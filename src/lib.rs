//! masss - plays sound files through a pool of warm, remote-controlled
//! playback engines so every trigger starts without a cold-start delay.

pub mod command;
pub mod config;
pub mod engine;
pub mod pool;

pub use command::{skip_from_filename, Sampler};
pub use config::AppConfig;
pub use pool::{InstanceId, PoolError, PoolStatus};
