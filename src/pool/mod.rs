//! Engine pool - keeps warm engines around so playback starts without delay.
//!
//! Architecture:
//! - `manager.rs` - Pool state, request handling and the actor loop
//! - `instance.rs` - One engine: playback state, volume and termination
//! - `scheduler.rs` - Deadline-ordered maintenance jobs and auto-stop timers
//! - `error.rs` - Pool error types

mod error;
mod instance;
mod manager;
mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{PoolError, Result};
pub use instance::{Cleanliness, Instance, PlaybackTimings, StopCallback, TerminationPolicy};
pub use manager::{InstanceId, InstancePool, PoolStatus, SlotStatus};
pub(crate) use manager::PoolRequest;
pub use scheduler::{Job, Scheduler, TimerId};
