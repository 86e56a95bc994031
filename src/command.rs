//! Public handle to the engine pool.
//!
//! [`Sampler`] is cheap to share behind an `Arc`. Every call is forwarded to
//! the pool actor and waits for its reply.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_channel::Sender;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::engine::{EngineLauncher, VlcLauncher};
use crate::pool::{InstanceId, InstancePool, PoolError, PoolRequest, PoolStatus, Result};

/// Front door for playing samples through the engine pool.
pub struct Sampler {
  requests: Sender<PoolRequest>,
  settings: Arc<RwLock<AppConfig>>,
  stopped: CancellationToken,
}

impl Sampler {
  /// Start the pool with engines launched from `config`.
  pub async fn start(config: AppConfig) -> Result<Self> {
    let program = non_empty(config.engine_path.as_deref()).map(PathBuf::from);
    let working_dir = non_empty(config.engine_working_dir.as_deref()).map(PathBuf::from);
    let launcher = VlcLauncher::new(program, working_dir, config.engine_args.clone())?;
    log::info!("Using engine at {}", launcher.program().display());
    Self::with_launcher(config, Arc::new(launcher)).await
  }

  /// Start the pool with a custom launcher.
  pub async fn with_launcher(config: AppConfig, launcher: Arc<dyn EngineLauncher>) -> Result<Self> {
    let mut pool = InstancePool::new(config.pool_config()?, launcher);
    pool.start().await?;

    let (requests, receiver) = async_channel::unbounded();
    let stopped = CancellationToken::new();
    let guard = stopped.clone().drop_guard();
    tokio::spawn(async move {
      let _guard = guard;
      pool.run(receiver).await;
    });

    Ok(Self {
      requests,
      settings: Arc::new(RwLock::new(config)),
      stopped,
    })
  }

  /// Settings as last applied, suitable for saving.
  pub fn settings(&self) -> AppConfig {
    self.settings.read().clone()
  }

  async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> PoolRequest) -> Result<T> {
    let (reply, response) = oneshot::channel();
    self
      .requests
      .send(make(reply))
      .await
      .map_err(|_| PoolError::ShutDown)?;
    response.await.map_err(|_| PoolError::ShutDown)
  }

  /// Play `filename` and return the instance it runs on.
  ///
  /// `on_stop` runs exactly once when playback ends, for whatever reason.
  pub async fn play(
    &self,
    filename: &str,
    skip: Option<u32>,
    on_stop: impl FnOnce() + Send + 'static,
  ) -> Result<InstanceId> {
    let filename = filename.to_string();
    self
      .request(|reply| PoolRequest::Play {
        filename,
        skip,
        on_stop: Box::new(on_stop),
        reply,
      })
      .await?
  }

  pub async fn stop(&self, id: InstanceId) -> Result<()> {
    self.request(|reply| PoolRequest::Stop { id, reply }).await?
  }

  pub async fn set_master_volume(&self, volume: f64) -> Result<()> {
    self
      .request(|reply| PoolRequest::SetMasterVolume { volume, reply })
      .await??;
    self.settings.write().master_volume = volume;
    Ok(())
  }

  pub async fn set_volume_modifier(&self, id: InstanceId, modifier: f64) -> Result<()> {
    self
      .request(|reply| PoolRequest::SetVolumeModifier {
        id,
        modifier,
        reply,
      })
      .await?
  }

  /// Set the equalizer from ten space-separated gains.
  pub async fn set_equalizer(&self, bands: &str) -> Result<()> {
    let owned = bands.to_string();
    self
      .request(|reply| PoolRequest::SetEqualizer { bands: owned, reply })
      .await??;
    self.settings.write().equalizer_bands = bands.trim().to_string();
    Ok(())
  }

  pub async fn set_skip_override(&self, seconds: Option<u32>) -> Result<()> {
    self
      .request(|reply| PoolRequest::SetSkipOverride { seconds, reply })
      .await??;
    self.settings.write().skip_override = seconds;
    Ok(())
  }

  pub async fn status(&self) -> Result<PoolStatus> {
    self.request(|reply| PoolRequest::Status { reply }).await
  }

  /// Shut every engine down and wait until the pool has stopped.
  ///
  /// Safe to call more than once, later calls just wait.
  pub async fn begin_shutdown(&self) {
    let (reply, response) = oneshot::channel();
    if self.requests.send(PoolRequest::Shutdown { reply }).await.is_ok() {
      let _ = response.await;
    }
    self.stopped.cancelled().await;
  }

  pub fn is_stopped(&self) -> bool {
    self.stopped.is_cancelled()
  }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
  value.filter(|s| !s.trim().is_empty())
}

/// Skip offset encoded in a file name as `<name>#<digits>.<ext>`.
///
/// The last digit is tenths of a second and is dropped.
pub fn skip_from_filename(path: &str) -> Option<u32> {
  let stem = Path::new(path).file_stem()?.to_str()?;
  let (_, marker) = stem.rsplit_once('#')?;
  if marker.is_empty() || !marker.bytes().all(|b| b.is_ascii_digit()) {
    return None;
  }
  let seconds = &marker[..marker.len() - 1];
  match seconds.parse::<u32>() {
    Ok(0) | Err(_) => None,
    Ok(seconds) => Some(seconds),
  }
}
