//! One engine process, its control socket and its playback state.

use std::time::Duration;

use tokio::time::Instant;

use super::scheduler::{Scheduler, TimerId};
use crate::engine::{ConnectedEngine, ControlSocket, EngineChild, EngineCommand, IpcError, SocketHealth};

/// Callback fired exactly once when a play request ends.
pub type StopCallback = Box<dyn FnOnce() + Send + 'static>;

/// Largest `get_length` response read in one go.
const LENGTH_RESPONSE_BYTES: usize = 256;

/// Delays used while starting a track.
#[derive(Debug, Clone)]
pub struct PlaybackTimings {
  /// Wait between `add` and `seek` so the engine has opened the file.
  pub seek_settle: Duration,
  /// Wait before draining and asking for the track length.
  pub length_query_delay: Duration,
  /// Upper bound on waiting for the `get_length` answer.
  pub response_timeout: Duration,
  /// Added to the track length before the auto-stop fires.
  pub auto_stop_margin: Duration,
}

impl Default for PlaybackTimings {
  fn default() -> Self {
    Self {
      seek_settle: Duration::from_millis(100),
      length_query_delay: Duration::from_millis(20),
      response_timeout: Duration::from_secs(2),
      auto_stop_margin: Duration::from_millis(500),
    }
  }
}

/// Elapsed-time thresholds for escalating termination.
#[derive(Debug, Clone)]
pub struct TerminationPolicy {
  pub terminate_after: Duration,
  pub kill_after: Duration,
  pub reap_after: Duration,
}

impl Default for TerminationPolicy {
  fn default() -> Self {
    Self {
      terminate_after: Duration::from_secs(1),
      kill_after: Duration::from_secs(3),
      reap_after: Duration::from_secs(5),
    }
  }
}

/// Termination bookkeeping, set once when the instance is retired.
#[derive(Debug, Clone, Copy)]
struct Termination {
  started: Instant,
  attempts: u8,
}

/// Outcome of polling an active instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanliness {
  Keep,
  /// Control connection lost; the engine is presumed dead.
  Crashed,
  /// Dirty and idle; should be replaced by a fresh engine.
  Obsolete,
}

pub struct Instance {
  child: Box<dyn EngineChild>,
  socket: Option<ControlSocket>,
  port: u16,
  volume_modifier: f64,
  volume_cache: f64,
  is_playing: bool,
  is_dirty: bool,
  termination: Option<Termination>,
  auto_stop: Option<TimerId>,
  on_stop: Option<StopCallback>,
}

impl Instance {
  pub fn new(engine: ConnectedEngine, volume_cache: f64) -> Self {
    Self {
      child: engine.child,
      socket: Some(engine.socket),
      port: engine.port,
      volume_modifier: 1.0,
      volume_cache,
      is_playing: false,
      is_dirty: false,
      termination: None,
      auto_stop: None,
      on_stop: None,
    }
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  pub fn is_playing(&self) -> bool {
    self.is_playing
  }

  pub fn is_dirty(&self) -> bool {
    self.is_dirty
  }

  pub fn mark_dirty(&mut self) {
    self.is_dirty = true;
  }

  /// Idle and still connected.
  pub fn is_ready(&self) -> bool {
    !self.is_playing && self.socket.is_some() && self.termination.is_none()
  }

  pub fn volume_modifier(&self) -> f64 {
    self.volume_modifier
  }

  pub fn termination_attempts(&self) -> u8 {
    self.termination.map(|t| t.attempts).unwrap_or(0)
  }

  /// Volume in engine units (256 = 100%).
  pub fn effective_volume(&self) -> i64 {
    (self.volume_cache * 256.0 * self.volume_modifier).round() as i64
  }

  async fn send(&mut self, cmd: EngineCommand) -> Result<(), IpcError> {
    match self.socket.as_mut() {
      Some(socket) => socket.send(&cmd).await,
      None => Err(IpcError::Disconnected),
    }
  }

  /// Fail fast on a dead peer, which would still accept one write.
  fn ensure_connected(&mut self) -> Result<(), IpcError> {
    match self.socket.as_mut().map(ControlSocket::poll_health) {
      None | Some(SocketHealth::Closed) => Err(IpcError::Disconnected),
      Some(SocketHealth::Output(text)) => {
        log::debug!("Engine {}: {}", self.port, text);
        Ok(())
      }
      Some(SocketHealth::Idle) => Ok(()),
    }
  }

  pub async fn apply_volume(&mut self) -> Result<(), IpcError> {
    self.ensure_connected()?;
    let volume = self.effective_volume();
    self.send(EngineCommand::Volume(volume)).await
  }

  pub async fn set_volume_cache(&mut self, volume: f64) -> Result<(), IpcError> {
    self.volume_cache = volume;
    self.apply_volume().await
  }

  pub async fn set_volume_modifier(&mut self, modifier: f64) -> Result<(), IpcError> {
    self.volume_modifier = modifier;
    self.apply_volume().await
  }

  /// Start `filename` on this engine.
  ///
  /// The callback is moved out of `on_stop` while the track starts. On error
  /// it is put back and nothing counts as playing, so the request can go to
  /// another instance.
  pub async fn play(
    &mut self,
    slot: usize,
    filename: &str,
    skip: Option<u32>,
    on_stop: &mut Option<StopCallback>,
    timings: &PlaybackTimings,
    scheduler: &mut Scheduler,
  ) -> Result<(), IpcError> {
    self.ensure_connected()?;

    if self.is_playing {
      log::warn!(
        "Engine {} is already playing, stopping it to start {}. Expect an audio glitch.",
        self.port,
        filename
      );
      self.stop(scheduler).await?;
    }

    let result = self
      .dispatch(slot, filename, skip, on_stop, timings, scheduler)
      .await;
    if result.is_err() {
      if let Some(callback) = self.take_on_stop(scheduler) {
        *on_stop = Some(callback);
      }
    }
    result
  }

  async fn dispatch(
    &mut self,
    slot: usize,
    filename: &str,
    skip: Option<u32>,
    on_stop: &mut Option<StopCallback>,
    timings: &PlaybackTimings,
    scheduler: &mut Scheduler,
  ) -> Result<(), IpcError> {
    self.send(EngineCommand::Add(filename.to_string())).await?;
    if let Some(skip) = skip {
      tokio::time::sleep(timings.seek_settle).await;
      self.send(EngineCommand::Seek(skip)).await?;
    }

    self.on_stop = on_stop.take();
    self.is_playing = true;

    match self.query_length(timings).await? {
      Some(length) => {
        let remaining = Duration::from_secs(length.saturating_sub(u64::from(skip.unwrap_or(0))));
        let timer = scheduler.start_timer(remaining + timings.auto_stop_margin, slot);
        self.auto_stop = Some(timer);
      }
      None => log::warn!(
        "Track length of {} was not reported, it will not stop automatically",
        filename
      ),
    }
    log::info!("Engine {} playing {}", self.port, filename);
    Ok(())
  }

  /// Undo a started track without firing its callback.
  pub fn take_on_stop(&mut self, scheduler: &mut Scheduler) -> Option<StopCallback> {
    if let Some(timer) = self.auto_stop.take() {
      scheduler.cancel(timer);
    }
    self.is_playing = false;
    self.on_stop.take()
  }

  /// Ask the engine for the current track length.
  async fn query_length(&mut self, timings: &PlaybackTimings) -> Result<Option<u64>, IpcError> {
    tokio::time::sleep(timings.length_query_delay).await;

    let socket = self.socket.as_mut().ok_or(IpcError::Disconnected)?;
    let stale = socket.drain()?;
    if !stale.trim().is_empty() {
      log::debug!("Engine {} discarded: {}", self.port, crate::engine::strip_prompts(&stale));
    }

    socket.send(&EngineCommand::GetLength).await?;
    let response = match socket
      .read_response(LENGTH_RESPONSE_BYTES, timings.response_timeout)
      .await
    {
      Ok(response) => response,
      Err(IpcError::Timeout) => return Ok(None),
      Err(e) => return Err(e),
    };
    Ok(crate::engine::parse_length(&response))
  }

  /// Stop playback and notify the requester.
  ///
  /// The callback fires even if the engine could not be told to stop; the
  /// transport error is still returned.
  pub async fn stop(&mut self, scheduler: &mut Scheduler) -> Result<(), IpcError> {
    let result = match self.ensure_connected() {
      Ok(()) => self.send(EngineCommand::Stop).await,
      Err(e) => Err(e),
    };
    self.finish_playback(scheduler);
    result
  }

  /// Cancel the auto-stop and fire the pending callback, if any.
  pub fn finish_playback(&mut self, scheduler: &mut Scheduler) {
    if let Some(timer) = self.auto_stop.take() {
      scheduler.cancel(timer);
    }
    if let Some(on_stop) = self.on_stop.take() {
      on_stop();
    }
    self.is_playing = false;
  }

  /// Whether the auto-stop armed for this instance is `timer`.
  pub fn owns_timer(&self, timer: TimerId) -> bool {
    self.auto_stop == Some(timer)
  }

  /// Poll the socket without blocking and decide whether to retire.
  pub fn cleanliness(&mut self) -> Cleanliness {
    let Some(socket) = self.socket.as_mut() else {
      return Cleanliness::Crashed;
    };
    match socket.poll_health() {
      SocketHealth::Closed => return Cleanliness::Crashed,
      SocketHealth::Output(text) => log::info!("Engine {}: {}", self.port, text),
      SocketHealth::Idle => {}
    }
    if self.is_dirty && !self.is_playing {
      Cleanliness::Obsolete
    } else {
      Cleanliness::Keep
    }
  }

  pub fn is_cleanable(&mut self) -> bool {
    self.cleanliness() != Cleanliness::Keep
  }

  /// Ask the engine to quit and close the control connection.
  pub async fn terminate(&mut self) {
    if let Some(mut socket) = self.socket.take() {
      if let Err(e) = socket.send(&EngineCommand::Shutdown).await {
        log::debug!("Engine {} did not take shutdown: {}", self.port, e);
      }
    }
    self.begin_termination();
  }

  /// Retire an engine whose connection is gone, without sending anything.
  pub fn terminate_broken(&mut self) {
    self.socket = None;
    self.begin_termination();
  }

  fn begin_termination(&mut self) {
    if self.termination.is_none() {
      self.termination = Some(Termination {
        started: Instant::now(),
        attempts: 1,
      });
    }
  }

  /// Poll for process exit, escalating signals as time passes.
  ///
  /// Returns true once the process is gone or has been killed unconditionally.
  pub fn check_termination(&mut self, policy: &TerminationPolicy, now: Instant) -> bool {
    match self.child.has_exited() {
      Ok(true) => return true,
      Ok(false) => {}
      Err(e) => log::warn!("Failed to poll engine {}: {}", self.port, e),
    }

    let Some(termination) = self.termination.as_mut() else {
      self.begin_termination();
      return false;
    };
    let elapsed = now.saturating_duration_since(termination.started);
    let pid = self.child.pid();

    if elapsed >= policy.reap_after && termination.attempts > 2 {
      log::warn!("Zombie engine {:?} on port {} has to be taken down", pid, self.port);
      if let Err(e) = self.child.reap() {
        log::warn!("Failed to reap engine {:?}: {}", pid, e);
      }
      return true;
    }
    if elapsed >= policy.kill_after && termination.attempts == 2 {
      log::warn!("Engine {:?} on port {} had to be killed", pid, self.port);
      termination.attempts = 3;
      if let Err(e) = self.child.kill() {
        log::warn!("Failed to kill engine {:?}: {}", pid, e);
      }
      return false;
    }
    if elapsed >= policy.terminate_after && termination.attempts == 1 {
      log::info!("Engine {:?} on port {} ignored shutdown, terminating", pid, self.port);
      termination.attempts = 2;
      if let Err(e) = self.child.terminate() {
        log::warn!("Failed to terminate engine {:?}: {}", pid, e);
      }
    }
    false
  }

  /// Kill without waiting for the escalation schedule.
  pub fn force_reap(&mut self) {
    if let Err(e) = self.child.reap() {
      log::warn!("Failed to reap engine {:?}: {}", self.child.pid(), e);
    }
  }
}

impl std::fmt::Debug for Instance {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Instance")
      .field("port", &self.port)
      .field("pid", &self.child.pid())
      .field("playing", &self.is_playing)
      .field("dirty", &self.is_dirty)
      .field("volume", &self.effective_volume())
      .field("termination_attempts", &self.termination_attempts())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  use super::*;
  use crate::engine::Equalizer;
  use crate::engine::EngineLauncher;
  use crate::pool::testing::{connect_fake, FakeLauncher, Stubbornness};

  fn fast_timings() -> PlaybackTimings {
    PlaybackTimings {
      seek_settle: Duration::from_millis(5),
      length_query_delay: Duration::from_millis(5),
      response_timeout: Duration::from_millis(300),
      auto_stop_margin: Duration::from_millis(500),
    }
  }

  fn counter() -> (Arc<AtomicUsize>, StopCallback) {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = count.clone();
    (
      count,
      Box::new(move || {
        inner.fetch_add(1, Ordering::SeqCst);
      }),
    )
  }

  #[tokio::test]
  async fn test_effective_volume() {
    let (launcher, ports) = FakeLauncher::with_free_ports(1);
    let engine = connect_fake(&launcher, ports.start()).await;
    let mut instance = Instance::new(engine, 0.5);

    assert_eq!(instance.effective_volume(), 128);
    instance.set_volume_modifier(1.5).await.unwrap();
    assert_eq!(instance.effective_volume(), 192);
    instance.set_volume_cache(0.33).await.unwrap();
    assert_eq!(instance.effective_volume(), (0.33_f64 * 256.0 * 1.5).round() as i64);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
      launcher.commands(ports.start()),
      vec!["volume 192".to_string(), "volume 127".to_string()]
    );
  }

  #[tokio::test]
  async fn test_play_sends_seek_and_arms_timer() {
    let (launcher, ports) = FakeLauncher::with_free_ports(1);
    launcher.set_length_response("status change: ( play state: 3 )\r\n> 30\r\n> ");
    let engine = connect_fake(&launcher, ports.start()).await;
    let mut instance = Instance::new(engine, 0.5);
    let mut scheduler = Scheduler::new();
    let (count, callback) = counter();
    let mut on_stop = Some(callback);

    instance
      .play(0, "/tmp/intro.ogg", Some(12), &mut on_stop, &fast_timings(), &mut scheduler)
      .await
      .unwrap();

    assert!(on_stop.is_none());
    assert!(instance.is_playing());
    assert_eq!(scheduler.len(), 1);
    // 30s track minus 12s skip plus margin
    let due = scheduler.next_due().unwrap();
    let remaining = due.saturating_duration_since(Instant::now());
    assert!(remaining > Duration::from_millis(18_000));
    assert!(remaining <= Duration::from_millis(18_500));

    assert_eq!(
      launcher.commands(ports.start()),
      vec![
        "add /tmp/intro.ogg".to_string(),
        "seek 12".to_string(),
        "get_length".to_string()
      ]
    );

    instance.stop(&mut scheduler).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!instance.is_playing());
    assert!(scheduler.is_empty());

    // A second stop must not fire the callback again.
    instance.stop(&mut scheduler).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_play_without_length_arms_nothing() {
    let (launcher, ports) = FakeLauncher::with_free_ports(1);
    launcher.set_length_response("0\r\n> ");
    let engine = connect_fake(&launcher, ports.start()).await;
    let mut instance = Instance::new(engine, 0.5);
    let mut scheduler = Scheduler::new();
    let (_count, callback) = counter();
    let mut on_stop = Some(callback);

    instance
      .play(0, "a.ogg", None, &mut on_stop, &fast_timings(), &mut scheduler)
      .await
      .unwrap();
    assert!(instance.is_playing());
    assert!(scheduler.is_empty());
  }

  #[tokio::test]
  async fn test_failed_play_hands_callback_back() {
    let (launcher, ports) = FakeLauncher::with_free_ports(1);
    launcher.hang_up_on_add(ports.start());
    let engine = connect_fake(&launcher, ports.start()).await;
    let mut instance = Instance::new(engine, 0.5);
    let mut scheduler = Scheduler::new();
    let (count, callback) = counter();
    let mut on_stop = Some(callback);

    let result = instance
      .play(0, "a.ogg", None, &mut on_stop, &fast_timings(), &mut scheduler)
      .await;

    assert!(result.is_err());
    assert!(on_stop.is_some());
    assert!(!instance.is_playing());
    assert!(scheduler.is_empty());
    assert_eq!(count.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_play_on_playing_instance_stops_first() {
    let (launcher, ports) = FakeLauncher::with_free_ports(1);
    let engine = connect_fake(&launcher, ports.start()).await;
    let mut instance = Instance::new(engine, 0.5);
    let mut scheduler = Scheduler::new();
    let (first, callback) = counter();
    let mut on_stop = Some(callback);
    instance
      .play(0, "a.ogg", None, &mut on_stop, &fast_timings(), &mut scheduler)
      .await
      .unwrap();

    let (second, callback) = counter();
    let mut on_stop = Some(callback);
    instance
      .play(0, "b.ogg", None, &mut on_stop, &fast_timings(), &mut scheduler)
      .await
      .unwrap();

    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.len(), 1);
  }

  #[tokio::test]
  async fn test_crash_detection() {
    let (launcher, ports) = FakeLauncher::with_free_ports(1);
    let engine = connect_fake(&launcher, ports.start()).await;
    let mut instance = Instance::new(engine, 0.5);
    assert_eq!(instance.cleanliness(), Cleanliness::Keep);

    launcher.crash(ports.start());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(instance.cleanliness(), Cleanliness::Crashed);
  }

  #[tokio::test]
  async fn test_dirty_idle_is_obsolete() {
    let (launcher, ports) = FakeLauncher::with_free_ports(1);
    let engine = connect_fake(&launcher, ports.start()).await;
    let mut instance = Instance::new(engine, 0.5);
    let mut scheduler = Scheduler::new();
    let mut on_stop: Option<StopCallback> = Some(Box::new(|| {}));
    instance
      .play(0, "a.ogg", None, &mut on_stop, &fast_timings(), &mut scheduler)
      .await
      .unwrap();

    instance.mark_dirty();
    assert_eq!(instance.cleanliness(), Cleanliness::Keep);
    instance.stop(&mut scheduler).await.unwrap();
    assert!(instance.is_cleanable());
  }

  #[tokio::test]
  async fn test_graceful_termination() {
    let (launcher, ports) = FakeLauncher::with_free_ports(1);
    let engine = connect_fake(&launcher, ports.start()).await;
    let mut instance = Instance::new(engine, 0.5);

    instance.terminate().await;
    assert_eq!(instance.termination_attempts(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(instance.check_termination(&TerminationPolicy::default(), Instant::now()));
    assert_eq!(launcher.signals(ports.start()), Vec::<&str>::new());
  }

  #[tokio::test]
  async fn test_termination_escalates_in_order() {
    let (launcher, ports) = FakeLauncher::with_free_ports(1);
    launcher.set_stubbornness(Stubbornness::IgnoreAll);
    let child = launcher.launch(ports.start(), &Equalizer::default()).unwrap();
    let socket = ControlSocket::connect(ports.start(), 5, Duration::from_millis(10))
      .await
      .unwrap();
    let mut instance = Instance::new(
      ConnectedEngine {
        child,
        socket,
        port: ports.start(),
      },
      0.5,
    );
    let policy = TerminationPolicy::default();

    instance.terminate().await;
    let start = Instant::now();

    assert!(!instance.check_termination(&policy, start + Duration::from_millis(500)));
    assert_eq!(instance.termination_attempts(), 1);

    // A late first poll only advances one step at a time.
    assert!(!instance.check_termination(&policy, start + Duration::from_secs(6)));
    assert_eq!(instance.termination_attempts(), 2);
    assert!(!instance.check_termination(&policy, start + Duration::from_secs(6)));
    assert_eq!(instance.termination_attempts(), 3);
    assert!(instance.check_termination(&policy, start + Duration::from_secs(6)));

    assert_eq!(launcher.signals(ports.start()), vec!["TERM", "KILL", "REAP"]);
  }
}
