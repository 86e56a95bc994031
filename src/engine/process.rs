//! Engine process detection and spawning.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use super::equalizer::Equalizer;

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("Engine executable not found")]
  NotFound,
  #[error("Failed to spawn engine: {0}")]
  SpawnFailed(#[from] io::Error),
  #[error("Failed to signal engine process {pid}: {source}")]
  SignalFailed { pid: u32, source: io::Error },
}

/// Control over a running engine process.
///
/// Every method is non-blocking; callers poll [`EngineChild::has_exited`]
/// rather than waiting.
pub trait EngineChild: Send {
  /// OS process id, if the process has not been reaped yet.
  fn pid(&self) -> Option<u32>;

  /// Whether the process has exited. Reaps it if so.
  fn has_exited(&mut self) -> io::Result<bool>;

  /// Ask the process to quit (SIGTERM on unix).
  fn terminate(&mut self) -> Result<(), ProcessError>;

  /// Force the process down through the child handle.
  fn kill(&mut self) -> Result<(), ProcessError>;

  /// Last resort: unconditional kill by pid, ignoring the child handle state.
  fn reap(&mut self) -> Result<(), ProcessError>;
}

/// Starts engine processes. Implemented by [`VlcLauncher`] in production.
pub trait EngineLauncher: Send + Sync {
  /// Spawn an engine serving its control protocol on `127.0.0.1:port`.
  fn launch(&self, port: u16, equalizer: &Equalizer) -> Result<Box<dyn EngineChild>, ProcessError>;
}

/// Find the engine executable in common locations.
pub fn find_engine() -> Option<PathBuf> {
  // Check PATH first
  if let Ok(path) = which::which("vlc") {
    return Some(path);
  }

  #[cfg(windows)]
  {
    let common_paths = [
      r"C:\Program Files\VideoLAN\VLC\vlc.exe",
      r"C:\Program Files (x86)\VideoLAN\VLC\vlc.exe",
    ];
    for path in common_paths {
      let p = PathBuf::from(path);
      if p.exists() {
        return Some(p);
      }
    }
  }

  #[cfg(target_os = "macos")]
  {
    let common_paths = [
      "/Applications/VLC.app/Contents/MacOS/VLC",
      "/usr/local/bin/vlc",
      "/opt/homebrew/bin/vlc",
    ];
    for path in common_paths {
      let p = PathBuf::from(path);
      if p.exists() {
        return Some(p);
      }
    }
  }

  #[cfg(target_os = "linux")]
  {
    let common_paths = ["/usr/bin/vlc", "/usr/local/bin/vlc", "/snap/bin/vlc"];
    for path in common_paths {
      let p = PathBuf::from(path);
      if p.exists() {
        return Some(p);
      }
    }
  }

  None
}

/// Launches VLC in remote-control mode.
#[derive(Debug, Clone)]
pub struct VlcLauncher {
  program: PathBuf,
  working_dir: Option<PathBuf>,
  extra_args: Vec<String>,
}

impl VlcLauncher {
  /// Use `program` if given, otherwise look the engine up.
  pub fn new(
    program: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    extra_args: Vec<String>,
  ) -> Result<Self, ProcessError> {
    let program = program
      .or_else(find_engine)
      .ok_or(ProcessError::NotFound)?;
    Ok(Self {
      program,
      working_dir,
      extra_args,
    })
  }

  pub fn program(&self) -> &PathBuf {
    &self.program
  }

  /// Command line for an engine bound to `port`.
  pub fn args(&self, port: u16, equalizer: &Equalizer) -> Vec<String> {
    let mut args = vec![
      "--audio-filter".to_string(),
      "equalizer".to_string(),
      "--no-equalizer-2pass".to_string(),
      "--equalizer-preamp".to_string(),
      equalizer.preamp().to_string(),
      "--equalizer-bands".to_string(),
      equalizer.band_string(),
      "-I".to_string(),
      "rc".to_string(),
      "--rc-host".to_string(),
      format!("127.0.0.1:{}", port),
    ];
    args.extend(self.extra_args.iter().cloned());
    args
  }
}

impl EngineLauncher for VlcLauncher {
  fn launch(&self, port: u16, equalizer: &Equalizer) -> Result<Box<dyn EngineChild>, ProcessError> {
    let args = self.args(port, equalizer);
    log::info!("Spawning engine: {:?} {:?}", self.program, args);

    let mut cmd = Command::new(&self.program);
    cmd
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);

    if let Some(dir) = &self.working_dir {
      cmd.current_dir(dir);
    }

    #[cfg(windows)]
    {
      const CREATE_NO_WINDOW: u32 = 0x0800_0000;
      cmd.creation_flags(CREATE_NO_WINDOW);
    }

    let mut child = cmd.spawn()?;

    if let Some(stdout) = child.stdout.take() {
      forward_output(port, stdout);
    }
    if let Some(stderr) = child.stderr.take() {
      forward_output(port, stderr);
    }

    Ok(Box::new(EngineProcess { child }))
  }
}

/// Drain a process output pipe into the log so the engine never blocks on it.
fn forward_output<R>(port: u16, pipe: R)
where
  R: AsyncRead + Send + Unpin + 'static,
{
  tokio::spawn(async move {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
      log::debug!(target: "engine", "[{}] {}", port, line);
    }
  });
}

/// A spawned engine process.
pub struct EngineProcess {
  child: Child,
}

impl EngineChild for EngineProcess {
  fn pid(&self) -> Option<u32> {
    self.child.id()
  }

  fn has_exited(&mut self) -> io::Result<bool> {
    Ok(self.child.try_wait()?.is_some())
  }

  #[cfg(unix)]
  fn terminate(&mut self) -> Result<(), ProcessError> {
    match self.child.id() {
      Some(pid) => signal(pid, libc::SIGTERM),
      None => Ok(()),
    }
  }

  #[cfg(not(unix))]
  fn terminate(&mut self) -> Result<(), ProcessError> {
    self.kill()
  }

  fn kill(&mut self) -> Result<(), ProcessError> {
    let pid = self.child.id().unwrap_or_default();
    self
      .child
      .start_kill()
      .map_err(|source| ProcessError::SignalFailed { pid, source })
  }

  #[cfg(unix)]
  fn reap(&mut self) -> Result<(), ProcessError> {
    if let Some(pid) = self.child.id() {
      signal(pid, libc::SIGKILL)?;
    }
    let _ = self.child.try_wait();
    Ok(())
  }

  #[cfg(not(unix))]
  fn reap(&mut self) -> Result<(), ProcessError> {
    self.kill()?;
    let _ = self.child.try_wait();
    Ok(())
  }
}

#[cfg(unix)]
fn signal(pid: u32, sig: libc::c_int) -> Result<(), ProcessError> {
  // SAFETY: kill(2) has no memory-safety preconditions.
  let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
  if rc == 0 {
    Ok(())
  } else {
    Err(ProcessError::SignalFailed {
      pid,
      source: io::Error::last_os_error(),
    })
  }
}
