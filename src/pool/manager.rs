//! Engine pool - routes play requests to idle engines and keeps spares around.
//!
//! All pool state lives in [`InstancePool`], owned by a single actor task.
//! Requests and maintenance jobs run to completion one at a time on that task,
//! so slot indices stay stable while a request is in flight. Retired slots are
//! tombstoned and only trimmed from the tail.
//!
//! Instance groups:
//! - `active` - indexed slots, the index is the public [`InstanceId`]
//! - `loading` - engines still handshaking in their own task
//! - `broken` - lost their control connection, waiting for the next comb
//! - `draining` - retired, waiting for their process to exit

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use async_channel::Receiver;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::{PoolError, Result};
use super::instance::{Cleanliness, Instance, StopCallback};
use super::scheduler::{Job, Scheduler, TimerId};
use crate::config::{PoolConfig, MAX_MASTER_VOLUME};
use crate::engine::{start_engine, ConnectedEngine, EngineError, EngineLauncher, Equalizer};

/// Public identifier of a playing instance: its slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct InstanceId(pub usize);

impl fmt::Display for InstanceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Snapshot of one active slot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStatus {
  pub port: u16,
  pub playing: bool,
  pub dirty: bool,
  pub volume_modifier: f64,
}

/// Snapshot of the whole pool, for diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
  pub slots: Vec<Option<SlotStatus>>,
  pub loading: usize,
  pub broken: usize,
  pub draining: usize,
  pub master_volume: f64,
  pub equalizer: String,
  pub skip_override: Option<u32>,
}

impl PoolStatus {
  pub fn idle_count(&self) -> usize {
    self
      .slots
      .iter()
      .flatten()
      .filter(|s| !s.playing)
      .count()
  }
}

/// Requests the façade sends to the pool actor.
pub(crate) enum PoolRequest {
  Play {
    filename: String,
    skip: Option<u32>,
    on_stop: StopCallback,
    reply: oneshot::Sender<Result<InstanceId>>,
  },
  Stop {
    id: InstanceId,
    reply: oneshot::Sender<Result<()>>,
  },
  SetMasterVolume {
    volume: f64,
    reply: oneshot::Sender<Result<()>>,
  },
  SetVolumeModifier {
    id: InstanceId,
    modifier: f64,
    reply: oneshot::Sender<Result<()>>,
  },
  SetEqualizer {
    bands: String,
    reply: oneshot::Sender<Result<()>>,
  },
  SetSkipOverride {
    seconds: Option<u32>,
    reply: oneshot::Sender<Result<()>>,
  },
  Status {
    reply: oneshot::Sender<PoolStatus>,
  },
  Shutdown {
    reply: oneshot::Sender<()>,
  },
}

/// An engine whose startup task has not been folded in yet.
struct LoadingInstance {
  port: u16,
  /// Equalizer generation the engine was launched with.
  generation: u64,
  handle: JoinHandle<std::result::Result<ConnectedEngine, EngineError>>,
}

pub struct InstancePool {
  config: PoolConfig,
  launcher: Arc<dyn EngineLauncher>,
  active: Vec<Option<Instance>>,
  loading: Vec<LoadingInstance>,
  broken: Vec<Instance>,
  draining: Vec<Instance>,
  scheduler: Scheduler,
  volume_cache: f64,
  equalizer: Equalizer,
  eq_generation: u64,
  skip_override: Option<u32>,
  next_port: u16,
  shutting_down: bool,
  cancel: CancellationToken,
}

impl InstancePool {
  pub fn new(config: PoolConfig, launcher: Arc<dyn EngineLauncher>) -> Self {
    Self {
      volume_cache: config.master_volume,
      equalizer: config.equalizer.clone(),
      eq_generation: 0,
      skip_override: config.skip_override,
      next_port: config.handshake.ports.start(),
      config,
      launcher,
      active: Vec::new(),
      loading: Vec::new(),
      broken: Vec::new(),
      draining: Vec::new(),
      scheduler: Scheduler::new(),
      shutting_down: false,
      cancel: CancellationToken::new(),
    }
  }

  /// Bring up the first engine. Failing here means no engine can run at all.
  pub async fn start(&mut self) -> Result<()> {
    let port = self.take_port();
    let engine = start_engine(
      self.launcher.as_ref(),
      port,
      &self.equalizer,
      &self.config.handshake,
    )
    .await?;
    let generation = self.eq_generation;
    self.adopt(engine, generation).await;
    Ok(())
  }

  fn ensure_running(&self) -> Result<()> {
    if self.shutting_down {
      Err(PoolError::ShutDown)
    } else {
      Ok(())
    }
  }

  fn take_port(&mut self) -> u16 {
    let port = self.next_port;
    self.next_port = self.config.handshake.ports.next(port);
    port
  }

  fn has_ready_instance(&self) -> bool {
    self.active.iter().flatten().any(Instance::is_ready)
  }

  /// Play `filename` on the first idle engine and return its id.
  pub async fn play(&mut self, filename: &str, skip: Option<u32>, on_stop: StopCallback) -> Result<InstanceId> {
    self.ensure_running()?;
    let skip = self.skip_override.or(skip);
    let mut on_stop = Some(on_stop);
    let mut assigned = None;

    for slot in 0..self.active.len() {
      let Some(instance) = self.active[slot].as_mut().filter(|i| i.is_ready()) else {
        continue;
      };
      match instance
        .play(slot, filename, skip, &mut on_stop, &self.config.playback, &mut self.scheduler)
        .await
      {
        Ok(()) => {
          assigned = Some(slot);
          break;
        }
        Err(e) => {
          log::warn!("Engine in slot {} failed while starting {}: {}", slot, filename, e);
          self.mark_broken(slot);
        }
      }
    }

    let slot = match assigned {
      Some(slot) => slot,
      None => {
        log::warn!("No idle engine for {}, starting one inline", filename);
        let slot = self.acquire_inline().await?;
        let instance = self.active[slot]
          .as_mut()
          .ok_or(PoolError::UnknownInstance(InstanceId(slot)))?;
        if let Err(e) = instance
          .play(slot, filename, skip, &mut on_stop, &self.config.playback, &mut self.scheduler)
          .await
        {
          log::warn!("Fresh engine in slot {} failed while starting {}: {}", slot, filename, e);
          self.mark_broken(slot);
          return Err(e.into());
        }
        slot
      }
    };

    if !self.has_ready_instance() {
      self.scheduler.schedule(Job::Refill);
    }
    Ok(InstanceId(slot))
  }

  /// Get an engine right now: a finished loading one, else a new one.
  async fn acquire_inline(&mut self) -> Result<usize> {
    if let Some(slot) = self.resolve_loading().await {
      return Ok(slot);
    }
    let port = self.take_port();
    let engine = start_engine(
      self.launcher.as_ref(),
      port,
      &self.equalizer,
      &self.config.handshake,
    )
    .await?;
    let generation = self.eq_generation;
    Ok(self.adopt(engine, generation).await)
  }

  pub async fn stop(&mut self, id: InstanceId) -> Result<()> {
    self.ensure_running()?;
    let slot = id.0;
    let Some(instance) = self.active.get_mut(slot).and_then(Option::as_mut) else {
      log::warn!("Stop requested for unknown instance {}", id);
      return Err(PoolError::UnknownInstance(id));
    };

    log::info!("Stopping instance {}", id);
    match instance.stop(&mut self.scheduler).await {
      Ok(()) => {
        if instance.is_dirty() {
          self.scheduler.schedule(Job::Comb);
        }
      }
      Err(e) => {
        log::warn!("Engine in slot {} failed to stop: {}", slot, e);
        self.mark_broken(slot);
      }
    }
    Ok(())
  }

  pub async fn set_master_volume(&mut self, volume: f64) -> Result<()> {
    self.ensure_running()?;
    if !volume.is_finite() || !(0.0..=MAX_MASTER_VOLUME).contains(&volume) {
      return Err(PoolError::InvalidVolume(volume));
    }
    self.volume_cache = volume;

    let mut failed = Vec::new();
    for (slot, instance) in self.active.iter_mut().enumerate() {
      if let Some(instance) = instance {
        if let Err(e) = instance.set_volume_cache(volume).await {
          log::warn!("Failed to set volume on slot {}: {}", slot, e);
          failed.push(slot);
        }
      }
    }
    for slot in failed {
      self.mark_broken(slot);
    }
    Ok(())
  }

  pub async fn set_volume_modifier(&mut self, id: InstanceId, modifier: f64) -> Result<()> {
    self.ensure_running()?;
    if !modifier.is_finite() || modifier < 0.0 {
      return Err(PoolError::InvalidVolume(modifier));
    }
    let instance = self
      .active
      .get_mut(id.0)
      .and_then(Option::as_mut)
      .ok_or(PoolError::UnknownInstance(id))?;
    if let Err(e) = instance.set_volume_modifier(modifier).await {
      log::warn!("Failed to set volume modifier on {}: {}", id, e);
      self.mark_broken(id.0);
    }
    Ok(())
  }

  /// Replace the equalizer. Running engines keep the old one until retired.
  pub async fn set_equalizer(&mut self, bands: &str) -> Result<()> {
    self.ensure_running()?;
    self.equalizer = Equalizer::parse(bands, self.equalizer.preamp())?;
    self.eq_generation += 1;
    log::info!("Equalizer set to {}", self.equalizer);

    for instance in self.active.iter_mut().flatten() {
      instance.mark_dirty();
    }
    self.scheduler.schedule(Job::Comb);
    Ok(())
  }

  pub fn set_skip_override(&mut self, seconds: Option<u32>) -> Result<()> {
    self.ensure_running()?;
    log::info!("Skip override set to {:?}", seconds);
    self.skip_override = seconds;
    Ok(())
  }

  pub fn status(&self) -> PoolStatus {
    PoolStatus {
      slots: self
        .active
        .iter()
        .map(|slot| {
          slot.as_ref().map(|i| SlotStatus {
            port: i.port(),
            playing: i.is_playing(),
            dirty: i.is_dirty(),
            volume_modifier: i.volume_modifier(),
          })
        })
        .collect(),
      loading: self.loading.len(),
      broken: self.broken.len(),
      draining: self.draining.len(),
      master_volume: self.volume_cache,
      equalizer: self.equalizer.band_string(),
      skip_override: self.skip_override,
    }
  }

  /// Move the instance in `slot` to the broken set and end its track.
  fn mark_broken(&mut self, slot: usize) {
    if let Some(mut instance) = self.active.get_mut(slot).and_then(Option::take) {
      log::warn!("Engine on port {} (slot {}) is broken", instance.port(), slot);
      instance.finish_playback(&mut self.scheduler);
      self.broken.push(instance);
    }
    self.scheduler.schedule(Job::Comb);
  }

  /// Put a connected engine into the first free slot.
  async fn adopt(&mut self, engine: ConnectedEngine, generation: u64) -> usize {
    self.next_port = self.config.handshake.ports.next(engine.port);
    let mut instance = Instance::new(engine, self.volume_cache);

    if generation != self.eq_generation {
      log::info!("Engine on port {} started with a stale equalizer", instance.port());
      instance.mark_dirty();
      self.scheduler.schedule(Job::Comb);
    }
    if let Err(e) = instance.apply_volume().await {
      log::warn!("Failed to set initial volume on port {}: {}", instance.port(), e);
      self.scheduler.schedule(Job::Comb);
    }

    let port = instance.port();
    let slot = match self.active.iter().position(Option::is_none) {
      Some(slot) => {
        self.active[slot] = Some(instance);
        slot
      }
      None => {
        self.active.push(Some(instance));
        self.active.len() - 1
      }
    };
    log::info!("Engine on port {} ready in slot {}", port, slot);
    slot
  }

  /// Start a spare engine in the background.
  fn spawn_loading(&mut self) {
    let port = self.take_port();
    let launcher = self.launcher.clone();
    let equalizer = self.equalizer.clone();
    let settings = self.config.handshake.clone();
    let cancel = self.cancel.child_token();

    log::info!("Starting spare engine from port {}", port);
    let handle = tokio::spawn(async move {
      tokio::select! {
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        result = start_engine(launcher.as_ref(), port, &equalizer, &settings) => result,
      }
    });

    self.loading.push(LoadingInstance {
      port,
      generation: self.eq_generation,
      handle,
    });
    self
      .scheduler
      .schedule_after(self.config.maintenance_interval, Job::ResolveLoading);
  }

  /// Fold finished startups into the active slots.
  ///
  /// Returns the slot of the first engine added, if any.
  async fn resolve_loading(&mut self) -> Option<usize> {
    let mut first_new = None;
    let mut i = 0;
    while i < self.loading.len() {
      if !self.loading[i].handle.is_finished() {
        i += 1;
        continue;
      }

      let loading = self.loading.remove(i);
      match loading.handle.await {
        Ok(Ok(engine)) => {
          let slot = self.adopt(engine, loading.generation).await;
          first_new.get_or_insert(slot);
        }
        Ok(Err(e)) => log::error!("Spare engine from port {} failed to start: {}", loading.port, e),
        Err(e) => log::error!("Spare engine task from port {} failed: {}", loading.port, e),
      }
    }
    first_new
  }

  /// Keep one idle engine available or on its way.
  async fn refill(&mut self) {
    self.resolve_loading().await;
    if !self.has_ready_instance() && self.loading.is_empty() {
      self.spawn_loading();
    }
  }

  /// Retire crashed and obsolete engines.
  async fn comb(&mut self) {
    for slot in 0..self.active.len() {
      let verdict = match self.active[slot].as_mut() {
        Some(instance) => instance.cleanliness(),
        None => continue,
      };
      if verdict == Cleanliness::Keep {
        continue;
      }
      let Some(mut instance) = self.active[slot].take() else {
        continue;
      };

      match verdict {
        Cleanliness::Crashed => {
          log::warn!("Engine on port {} (slot {}) lost its connection", instance.port(), slot);
          instance.finish_playback(&mut self.scheduler);
          instance.terminate_broken();
        }
        _ => {
          log::info!("Retiring obsolete engine on port {} (slot {})", instance.port(), slot);
          instance.terminate().await;
        }
      }
      self.draining.push(instance);
    }

    for mut instance in std::mem::take(&mut self.broken) {
      instance.terminate_broken();
      self.draining.push(instance);
    }

    while matches!(self.active.last(), Some(None)) {
      self.active.pop();
    }

    self.scheduler.schedule(Job::Refill);
    self.scheduler.schedule(Job::TerminateOld);
  }

  /// Advance termination of retired engines.
  fn terminate_old(&mut self) {
    let now = Instant::now();
    let policy = &self.config.termination;
    self.draining.retain_mut(|instance| {
      let dead = instance.check_termination(policy, now);
      if dead {
        log::info!("Engine on port {} terminated", instance.port());
      }
      !dead
    });

    if !self.draining.is_empty() && !self.shutting_down {
      self
        .scheduler
        .schedule_after(self.config.maintenance_interval, Job::TerminateOld);
    }
  }

  async fn auto_stop(&mut self, slot: usize, timer: TimerId) {
    let owns = self
      .active
      .get(slot)
      .and_then(Option::as_ref)
      .is_some_and(|i| i.owns_timer(timer));
    if !owns {
      log::debug!("Ignoring stale auto-stop for slot {}", slot);
      return;
    }
    log::info!("Track in slot {} reached its end", slot);
    if let Err(e) = self.stop(InstanceId(slot)).await {
      log::warn!("Auto-stop of slot {} failed: {}", slot, e);
    }
  }

  async fn run_job(&mut self, job: Job) {
    match job {
      Job::ResolveLoading => {
        self.resolve_loading().await;
        if !self.loading.is_empty() {
          self
            .scheduler
            .schedule_after(self.config.maintenance_interval, Job::ResolveLoading);
        }
      }
      Job::Refill => self.refill().await,
      Job::Comb => self.comb().await,
      Job::TerminateOld => self.terminate_old(),
      Job::AutoStop { slot, timer } => self.auto_stop(slot, timer).await,
    }
  }

  /// Run every job whose deadline has passed.
  pub async fn run_due_jobs(&mut self) {
    let now = Instant::now();
    while let Some(job) = self.scheduler.pop_due(now) {
      self.run_job(job).await;
    }
  }

  /// Terminate every engine and wait for them to exit.
  ///
  /// Only the first call does anything. Engines still handshaking are
  /// cancelled; one whose task had already finished is drained like the rest,
  /// otherwise its process is killed when the cancelled task drops it.
  pub async fn shutdown(&mut self) {
    if self.shutting_down {
      log::info!("Engine pool shutdown already in progress");
      return;
    }
    self.shutting_down = true;
    log::info!("Shutting down engine pool");

    self.scheduler.clear();
    self.cancel.cancel();

    for loading in std::mem::take(&mut self.loading) {
      match loading.handle.await {
        Ok(Ok(engine)) => {
          let mut instance = Instance::new(engine, self.volume_cache);
          instance.terminate().await;
          self.draining.push(instance);
        }
        Ok(Err(e)) => log::debug!("Spare engine from port {} abandoned: {}", loading.port, e),
        Err(e) => log::warn!("Spare engine task from port {} failed: {}", loading.port, e),
      }
    }

    for mut instance in std::mem::take(&mut self.active).into_iter().flatten() {
      instance.finish_playback(&mut self.scheduler);
      instance.terminate().await;
      self.draining.push(instance);
    }
    for mut instance in std::mem::take(&mut self.broken) {
      instance.terminate_broken();
      self.draining.push(instance);
    }

    let steps = self.config.shutdown_steps.clone();
    for step in steps {
      tokio::time::sleep(step).await;
      self.terminate_old();
      if self.draining.is_empty() {
        log::info!("All engines terminated");
        return;
      }
    }

    for mut instance in self.draining.drain(..) {
      log::warn!("Engine on port {} survived shutdown, reaping", instance.port());
      instance.force_reap();
    }
  }

  /// Serve requests and scheduled jobs until shutdown.
  pub(crate) async fn run(mut self, requests: Receiver<PoolRequest>) {
    log::info!("Engine pool running");
    loop {
      let next_due = self.scheduler.next_due();
      tokio::select! {
        request = requests.recv() => match request {
          Ok(request) => {
            if self.handle(request).await.is_break() {
              break;
            }
          }
          Err(_) => {
            log::info!("All pool handles dropped");
            self.shutdown().await;
            break;
          }
        },
        _ = wait_until(next_due) => self.run_due_jobs().await,
      }
    }
    log::info!("Engine pool stopped");
  }

  async fn handle(&mut self, request: PoolRequest) -> ControlFlow<()> {
    match request {
      PoolRequest::Play {
        filename,
        skip,
        on_stop,
        reply,
      } => {
        let _ = reply.send(self.play(&filename, skip, on_stop).await);
      }
      PoolRequest::Stop { id, reply } => {
        let _ = reply.send(self.stop(id).await);
      }
      PoolRequest::SetMasterVolume { volume, reply } => {
        let _ = reply.send(self.set_master_volume(volume).await);
      }
      PoolRequest::SetVolumeModifier {
        id,
        modifier,
        reply,
      } => {
        let _ = reply.send(self.set_volume_modifier(id, modifier).await);
      }
      PoolRequest::SetEqualizer { bands, reply } => {
        let _ = reply.send(self.set_equalizer(&bands).await);
      }
      PoolRequest::SetSkipOverride { seconds, reply } => {
        let _ = reply.send(self.set_skip_override(seconds));
      }
      PoolRequest::Status { reply } => {
        let _ = reply.send(self.status());
      }
      PoolRequest::Shutdown { reply } => {
        self.shutdown().await;
        let _ = reply.send(());
        return ControlFlow::Break(());
      }
    }
    ControlFlow::Continue(())
  }
}

async fn wait_until(deadline: Option<Instant>) {
  match deadline {
    Some(deadline) => tokio::time::sleep_until(deadline).await,
    None => std::future::pending().await,
  }
}
