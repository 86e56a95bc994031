//! Engine startup: spawn a process, then negotiate its control socket.

use std::time::Duration;

use thiserror::Error;

use super::equalizer::Equalizer;
use super::ipc::{ControlSocket, IpcError};
use super::process::{EngineChild, EngineLauncher, ProcessError};

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("Process error: {0}")]
  Process(#[from] ProcessError),
  #[error("IPC error: {0}")]
  Ipc(#[from] IpcError),
  #[error("Failed to connect to an engine after {0} ports")]
  PortsExhausted(u32),
  #[error("Engine startup cancelled")]
  Cancelled,
}

/// Inclusive range of control ports engines are bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
  start: u16,
  end: u16,
}

impl Default for PortRange {
  fn default() -> Self {
    Self {
      start: 8990,
      end: 9089,
    }
  }
}

impl PortRange {
  /// Returns `None` if `start > end`.
  pub fn new(start: u16, end: u16) -> Option<Self> {
    (start <= end).then_some(Self { start, end })
  }

  pub fn start(&self) -> u16 {
    self.start
  }

  pub fn end(&self) -> u16 {
    self.end
  }

  pub fn contains(&self, port: u16) -> bool {
    (self.start..=self.end).contains(&port)
  }

  /// The port to try after `port`, wrapping from the end back to the start.
  pub fn next(&self, port: u16) -> u16 {
    if port == self.end || !self.contains(port) {
      self.start
    } else {
      port + 1
    }
  }
}

/// Timing and retry budget for bringing up one engine.
#[derive(Debug, Clone)]
pub struct HandshakeSettings {
  pub ports: PortRange,
  /// Ports tried before giving up for good.
  pub max_port_attempts: u32,
  /// Delay between spawning and the first connect attempt.
  pub grace: Duration,
  /// Connect attempts after the first one, per port.
  pub connect_retries: u32,
  pub connect_retry_interval: Duration,
}

impl Default for HandshakeSettings {
  fn default() -> Self {
    Self {
      ports: PortRange::default(),
      max_port_attempts: 99,
      grace: Duration::from_millis(80),
      connect_retries: 10,
      connect_retry_interval: Duration::from_millis(200),
    }
  }
}

/// An engine process with an established control connection.
pub struct ConnectedEngine {
  pub child: Box<dyn EngineChild>,
  pub socket: ControlSocket,
  pub port: u16,
}

impl std::fmt::Debug for ConnectedEngine {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectedEngine")
      .field("pid", &self.child.pid())
      .field("port", &self.port)
      .finish()
  }
}

/// Spawn an engine and connect to it, walking the port range on failure.
///
/// A port whose engine never accepts a connection is abandoned: the process is
/// killed and the next port is tried. Failing to spawn at all is returned
/// immediately since another port will not help.
pub async fn start_engine(
  launcher: &dyn EngineLauncher,
  first_port: u16,
  equalizer: &Equalizer,
  settings: &HandshakeSettings,
) -> Result<ConnectedEngine, EngineError> {
  let mut port = first_port;

  for _ in 0..settings.max_port_attempts {
    let mut child = launcher.launch(port, equalizer)?;

    tokio::time::sleep(settings.grace).await;

    match ControlSocket::connect(port, settings.connect_retries, settings.connect_retry_interval).await {
      Ok(socket) => {
        log::info!("Engine started on port {} (pid {:?})", port, child.pid());
        return Ok(ConnectedEngine {
          child,
          socket,
          port,
        });
      }
      Err(e) => {
        log::warn!("Engine on port {} never accepted a control connection: {}", port, e);
        if let Err(e) = child.kill() {
          log::warn!("Failed to kill engine on port {}: {}", port, e);
        }
        let _ = child.has_exited();
      }
    }

    port = settings.ports.next(port);
  }

  log::error!(
    "Failed to start an engine after {} port attempts",
    settings.max_port_attempts
  );
  Err(EngineError::PortsExhausted(settings.max_port_attempts))
}
