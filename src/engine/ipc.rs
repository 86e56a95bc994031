//! Control socket connection to an engine.
//!
//! A plain loopback TCP stream. Writes are whole lines; reads are either a
//! bounded wait for a response or a non-blocking drain of whatever is buffered.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::protocol::{strip_prompts, EngineCommand};

/// Read chunk size for drains and responses.
const READ_CHUNK: usize = 512;

#[derive(Error, Debug)]
pub enum IpcError {
  #[error("Connection failed: {0}")]
  ConnectionFailed(String),
  #[error("Write failed: {0}")]
  WriteFailed(#[source] io::Error),
  #[error("Read failed: {0}")]
  ReadFailed(#[source] io::Error),
  #[error("Response timeout")]
  Timeout,
  #[error("Disconnected")]
  Disconnected,
}

/// What a non-blocking poll of the socket found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketHealth {
  /// Nothing to read, connection alive.
  Idle,
  /// Connection alive, the engine printed something.
  Output(String),
  /// The engine closed the connection or the socket is in error.
  Closed,
}

/// Control connection to one engine process.
#[derive(Debug)]
pub struct ControlSocket {
  stream: TcpStream,
  port: u16,
}

impl ControlSocket {
  /// Connect to the engine listening on `127.0.0.1:port`.
  ///
  /// Makes one attempt plus up to `retries` more, sleeping `interval` between
  /// them.
  pub async fn connect(port: u16, retries: u32, interval: Duration) -> Result<Self, IpcError> {
    let mut last_error = None;

    for attempt in 0..=retries {
      if attempt > 0 {
        tokio::time::sleep(interval).await;
      }

      match Self::try_connect(port).await {
        Ok(socket) => return Ok(socket),
        Err(e) => {
          log::debug!("Control connect to port {} attempt {} failed: {}", port, attempt + 1, e);
          last_error = Some(e);
        }
      }
    }

    Err(last_error.unwrap_or_else(|| IpcError::ConnectionFailed("Unknown error".into())))
  }

  async fn try_connect(port: u16) -> Result<Self, IpcError> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let stream = TcpStream::connect(addr)
      .await
      .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;
    let _ = stream.set_nodelay(true);
    Ok(Self { stream, port })
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  /// Write one command line.
  pub async fn send(&mut self, cmd: &EngineCommand) -> Result<(), IpcError> {
    log::debug!("Engine {} <- {}", self.port, cmd);
    self
      .stream
      .write_all(&cmd.encode())
      .await
      .map_err(IpcError::WriteFailed)?;
    self.stream.flush().await.map_err(IpcError::WriteFailed)
  }

  /// Wait for the next chunk of output, at most `max_bytes` long.
  pub async fn read_response(&mut self, max_bytes: usize, timeout: Duration) -> Result<String, IpcError> {
    let mut buf = vec![0u8; max_bytes.max(1)];
    match tokio::time::timeout(timeout, self.stream.read(&mut buf)).await {
      Ok(Ok(0)) => Err(IpcError::Disconnected),
      Ok(Ok(n)) => Ok(String::from_utf8_lossy(&buf[..n]).into_owned()),
      Ok(Err(e)) => Err(IpcError::ReadFailed(e)),
      Err(_) => Err(IpcError::Timeout),
    }
  }

  /// Discard everything currently buffered without waiting.
  ///
  /// Returns the discarded text so callers can log it.
  pub fn drain(&mut self) -> Result<String, IpcError> {
    if let Ok(Some(e)) = self.stream.take_error() {
      return Err(IpcError::ReadFailed(e));
    }

    let mut drained = Vec::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
      match self.stream.try_read(&mut buf) {
        Ok(0) => return Err(IpcError::Disconnected),
        Ok(n) => drained.extend_from_slice(&buf[..n]),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
        Err(e) => return Err(IpcError::ReadFailed(e)),
      }
    }
    Ok(String::from_utf8_lossy(&drained).into_owned())
  }

  /// Non-blocking check for crash or pending output.
  pub fn poll_health(&mut self) -> SocketHealth {
    match self.drain() {
      Ok(text) if text.is_empty() => SocketHealth::Idle,
      Ok(text) => SocketHealth::Output(strip_prompts(&text)),
      Err(e) => {
        log::debug!("Engine {} control socket closed: {}", self.port, e);
        SocketHealth::Closed
      }
    }
  }
}
