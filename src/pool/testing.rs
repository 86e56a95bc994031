//! In-process stand-in for the engine, used by unit tests.
//!
//! Each launch binds the requested loopback port and serves the RC protocol
//! from a tokio task, recording every command line it receives.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, TcpListener as StdListener};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::engine::{
  ConnectedEngine, ControlSocket, EngineChild, EngineLauncher, Equalizer, PortRange, ProcessError,
};

/// How hard a fake engine resists being shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stubbornness {
  /// Exits on the `shutdown` command.
  Cooperative,
  /// Ignores `shutdown`, exits on SIGTERM.
  IgnoreShutdown,
  /// Only an unconditional reap takes it down.
  IgnoreAll,
}

#[derive(Default)]
struct EngineState {
  commands: Vec<String>,
  signals: Vec<&'static str>,
  equalizer: Option<String>,
}

struct FakeEngine {
  exited: Arc<AtomicBool>,
  cancel: CancellationToken,
}

#[derive(Clone)]
pub struct FakeLauncher {
  inner: Arc<Inner>,
}

struct Inner {
  launches: AtomicUsize,
  refused: Mutex<Vec<u16>>,
  hang_up_on_add: Mutex<Vec<u16>>,
  length_response: Mutex<String>,
  stubbornness: Mutex<Stubbornness>,
  engines: Mutex<HashMap<u16, FakeEngine>>,
  state: Mutex<HashMap<u16, EngineState>>,
}

static NEXT_BASE_PORT: AtomicU16 = AtomicU16::new(0);

/// Reserve `count` consecutive loopback ports that are currently free.
fn free_ports(count: u16) -> PortRange {
  let _ = NEXT_BASE_PORT.compare_exchange(
    0,
    20_000 + (std::process::id() % 500) as u16 * 40,
    Ordering::SeqCst,
    Ordering::SeqCst,
  );
  loop {
    let base = NEXT_BASE_PORT.fetch_add(count + 1, Ordering::SeqCst);
    let all_free = (base..base + count).all(|p| StdListener::bind((Ipv4Addr::LOCALHOST, p)).is_ok());
    if all_free {
      if let Some(range) = PortRange::new(base, base + count - 1) {
        return range;
      }
    }
  }
}

impl FakeLauncher {
  /// A launcher plus a range of `count` ports reserved for it.
  pub fn with_free_ports(count: u16) -> (Self, PortRange) {
    let launcher = Self {
      inner: Arc::new(Inner {
        launches: AtomicUsize::new(0),
        refused: Mutex::new(Vec::new()),
        hang_up_on_add: Mutex::new(Vec::new()),
        length_response: Mutex::new("> 60\r\n> ".to_string()),
        stubbornness: Mutex::new(Stubbornness::Cooperative),
        engines: Mutex::new(HashMap::new()),
        state: Mutex::new(HashMap::new()),
      }),
    };
    (launcher, free_ports(count.max(1)))
  }

  /// Engines launched on `port` will never listen.
  pub fn refuse_port(&self, port: u16) {
    self.inner.refused.lock().push(port);
  }

  /// The engine on `port` dies as soon as it is asked to play something.
  pub fn hang_up_on_add(&self, port: u16) {
    self.inner.hang_up_on_add.lock().push(port);
  }

  pub fn set_length_response(&self, response: &str) {
    *self.inner.length_response.lock() = response.to_string();
  }

  pub fn set_stubbornness(&self, stubbornness: Stubbornness) {
    *self.inner.stubbornness.lock() = stubbornness;
  }

  pub fn launch_count(&self) -> usize {
    self.inner.launches.load(Ordering::SeqCst)
  }

  /// Command lines received by the engine on `port`, across all its launches.
  pub fn commands(&self, port: u16) -> Vec<String> {
    self
      .inner
      .state
      .lock()
      .get(&port)
      .map(|s| s.commands.clone())
      .unwrap_or_default()
  }

  /// Count of a given command line across all engines.
  pub fn count_command(&self, command: &str) -> usize {
    self
      .inner
      .state
      .lock()
      .values()
      .map(|s| s.commands.iter().filter(|c| *c == command).count())
      .sum()
  }

  /// Signals delivered to the engine on `port`, in order.
  pub fn signals(&self, port: u16) -> Vec<&'static str> {
    self
      .inner
      .state
      .lock()
      .get(&port)
      .map(|s| s.signals.clone())
      .unwrap_or_default()
  }

  /// Band string the engine on `port` was launched with.
  pub fn equalizer(&self, port: u16) -> Option<String> {
    self.inner.state.lock().get(&port).and_then(|s| s.equalizer.clone())
  }

  /// Drop the control connection and exit, as a crashing engine would.
  pub fn crash(&self, port: u16) {
    if let Some(engine) = self.inner.engines.lock().get(&port) {
      engine.exited.store(true, Ordering::SeqCst);
      engine.cancel.cancel();
    }
  }

  /// Ports of engines that are still running.
  pub fn running_ports(&self) -> Vec<u16> {
    let mut ports: Vec<u16> = self
      .inner
      .engines
      .lock()
      .iter()
      .filter(|(_, e)| !e.exited.load(Ordering::SeqCst))
      .map(|(p, _)| *p)
      .collect();
    ports.sort_unstable();
    ports
  }
}

impl EngineLauncher for FakeLauncher {
  fn launch(&self, port: u16, equalizer: &Equalizer) -> Result<Box<dyn EngineChild>, ProcessError> {
    self.inner.launches.fetch_add(1, Ordering::SeqCst);
    let stubbornness = *self.inner.stubbornness.lock();
    let exited = Arc::new(AtomicBool::new(false));
    let cancel = CancellationToken::new();

    self
      .inner
      .state
      .lock()
      .entry(port)
      .or_default()
      .equalizer = Some(equalizer.band_string());

    let listener = if self.inner.refused.lock().contains(&port) {
      None
    } else {
      bind(port).ok()
    };

    match listener {
      Some(listener) => {
        let inner = self.inner.clone();
        let exited = exited.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
          tokio::select! {
            _ = cancel.cancelled() => {}
            _ = serve(listener, port, inner, exited.clone(), stubbornness) => {}
          }
        });
      }
      // Nothing listens, the process "dies" right away.
      None => exited.store(true, Ordering::SeqCst),
    }

    self.inner.engines.lock().insert(
      port,
      FakeEngine {
        exited: exited.clone(),
        cancel: cancel.clone(),
      },
    );

    Ok(Box::new(FakeChild {
      port,
      inner: self.inner.clone(),
      exited,
      cancel,
      stubbornness,
    }))
  }
}

fn bind(port: u16) -> io::Result<TcpListener> {
  let listener = StdListener::bind((Ipv4Addr::LOCALHOST, port))?;
  listener.set_nonblocking(true)?;
  TcpListener::from_std(listener)
}

async fn serve(
  listener: TcpListener,
  port: u16,
  inner: Arc<Inner>,
  exited: Arc<AtomicBool>,
  stubbornness: Stubbornness,
) {
  let Ok((stream, _)) = listener.accept().await else {
    return;
  };
  drop(listener);

  let (reader, mut writer) = stream.into_split();
  let mut lines = BufReader::new(reader).lines();

  while let Ok(Some(line)) = lines.next_line().await {
    inner
      .state
      .lock()
      .entry(port)
      .or_default()
      .commands
      .push(line.clone());

    if line.starts_with("add ") && inner.hang_up_on_add.lock().contains(&port) {
      exited.store(true, Ordering::SeqCst);
      break;
    }

    match line.as_str() {
      "get_length" => {
        let response = inner.length_response.lock().clone();
        if writer.write_all(response.as_bytes()).await.is_err() {
          break;
        }
      }
      "shutdown" if stubbornness == Stubbornness::Cooperative => {
        exited.store(true, Ordering::SeqCst);
        break;
      }
      _ => {}
    }
  }
}

struct FakeChild {
  port: u16,
  inner: Arc<Inner>,
  exited: Arc<AtomicBool>,
  cancel: CancellationToken,
  stubbornness: Stubbornness,
}

impl FakeChild {
  fn record(&self, signal: &'static str) {
    self
      .inner
      .state
      .lock()
      .entry(self.port)
      .or_default()
      .signals
      .push(signal);
  }

  fn exit(&self) {
    self.exited.store(true, Ordering::SeqCst);
    self.cancel.cancel();
  }
}

impl EngineChild for FakeChild {
  fn pid(&self) -> Option<u32> {
    Some(u32::from(self.port))
  }

  fn has_exited(&mut self) -> io::Result<bool> {
    Ok(self.exited.load(Ordering::SeqCst))
  }

  fn terminate(&mut self) -> Result<(), ProcessError> {
    self.record("TERM");
    if self.stubbornness != Stubbornness::IgnoreAll {
      self.exit();
    }
    Ok(())
  }

  fn kill(&mut self) -> Result<(), ProcessError> {
    self.record("KILL");
    if self.stubbornness != Stubbornness::IgnoreAll {
      self.exit();
    }
    Ok(())
  }

  fn reap(&mut self) -> Result<(), ProcessError> {
    self.record("REAP");
    self.exit();
    Ok(())
  }
}

impl Drop for FakeChild {
  fn drop(&mut self) {
    self.exit();
  }
}

/// Launch a fake engine on `port` and connect to it.
pub async fn connect_fake(launcher: &FakeLauncher, port: u16) -> ConnectedEngine {
  let child = launcher
    .launch(port, &Equalizer::default())
    .expect("fake launch");
  let socket = ControlSocket::connect(port, 10, Duration::from_millis(10))
    .await
    .expect("fake connect");
  ConnectedEngine {
    child,
    socket,
    port,
  }
}
