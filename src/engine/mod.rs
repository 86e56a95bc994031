//! Engine module - spawns and controls external playback engines over their
//! remote-control socket.
//!
//! Architecture:
//! - `process.rs` - Engine binary detection and process spawning
//! - `client.rs` - Engine startup: spawn, then connect, walking the port range
//! - `ipc.rs` - Loopback TCP control connection
//! - `protocol.rs` - RC command encoding and response parsing
//! - `equalizer.rs` - Startup equalizer settings

mod client;
mod equalizer;
mod ipc;
mod process;
mod protocol;

pub use client::{start_engine, ConnectedEngine, EngineError, HandshakeSettings, PortRange};
pub use equalizer::{Equalizer, EqualizerError, BAND_COUNT, DEFAULT_PREAMP};
pub use ipc::{ControlSocket, IpcError, SocketHealth};
pub use process::{find_engine, EngineChild, EngineLauncher, ProcessError, VlcLauncher};
pub use protocol::{parse_length, strip_prompts, EngineCommand};
