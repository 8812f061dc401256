use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

pub mod api;
pub mod config;
pub mod dashboard;
pub mod jobs;
pub mod mpv;
pub mod playback;
pub mod sync;

pub use api::{ApiClient, ApiError};
pub use config::{AppConfig, ConfigError};
pub use dashboard::{Dashboard, DashboardError, TaskOverview};
pub use jobs::JobBoard;
pub use playback::{PlaybackController, PlaybackNotice, PlaybackRequest};

use mpv::{MpvAdaptiveEngine, MpvError, MpvPlayer};
use playback::PlaybackError;

#[derive(Error, Debug)]
pub enum RunError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error(transparent)]
  Api(#[from] ApiError),
  #[error(transparent)]
  Dashboard(#[from] DashboardError),
  #[error(transparent)]
  Mpv(#[from] MpvError),
  #[error(transparent)]
  Playback(#[from] PlaybackError),
  #[error("Signal handler failed: {0}")]
  Signal(#[from] std::io::Error),
}

/// MPV plus the controller that owns its playback session.
pub struct Player {
  pub mpv: Arc<MpvPlayer>,
  pub controller: PlaybackController,
  pub notices: async_channel::Receiver<PlaybackNotice>,
}

/// Launch MPV as configured and put a playback controller in front of it.
pub async fn launch_player(config: &AppConfig) -> Result<Player, RunError> {
  let binary = config.mpv_binary();
  let mpv = Arc::new(MpvPlayer::launch(binary.as_deref(), &config.mpv_args).await?);
  let engine = Arc::new(MpvAdaptiveEngine::new(mpv.clone()));
  let (controller, notices) = PlaybackController::new(config.api_base.clone(), engine);
  controller.host_ready(mpv.clone()).await?;
  Ok(Player {
    mpv,
    controller,
    notices,
  })
}

async fn next_notice(player: &Option<Player>) -> Option<PlaybackNotice> {
  match player {
    Some(player) => player.notices.recv().await.ok(),
    None => std::future::pending().await,
  }
}

/// Install `env_logger`, defaulting to `info` unless `RUST_LOG` says otherwise.
pub fn init_logging() {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
    .format_timestamp_millis()
    .init();
}

/// Mirror the server and log what changes until Ctrl-C. With `watch_live`,
/// that task's live stream is also played in MPV.
pub async fn run(config: AppConfig, watch_live: Option<String>) -> Result<(), RunError> {
  let client = ApiClient::new(&config.api_base, config.request_timeout())?;
  let dashboard = Dashboard::start(client, &config);

  let player = match &watch_live {
    Some(task_id) => {
      let player = launch_player(&config).await?;
      player.controller.open(dashboard.live_request(task_id)?).await?;
      Some(player)
    }
    None => None,
  };

  let mut tasks_rx = dashboard.subscribe_tasks();
  let mut active_rx = dashboard.subscribe_active();
  let mut jobs_rx = dashboard.jobs().subscribe();

  let mut known_tasks: HashMap<String, String> = HashMap::new();
  let mut recording: HashSet<String> = HashSet::new();
  let mut jobs = api::ConversionTable::new();

  loop {
    tokio::select! {
      signal = tokio::signal::ctrl_c() => {
        signal?;
        log::info!("Ctrl-C received, shutting down");
        break;
      }
      Ok(()) = tasks_rx.changed() => {
        let tasks: HashMap<String, String> = tasks_rx
          .borrow()
          .as_ref()
          .map(|s| s.value.iter().map(|t| (t.id.clone(), t.name.clone())).collect())
          .unwrap_or_default();
        for (id, name) in &tasks {
          if !known_tasks.contains_key(id) {
            log::info!("Task {} ({})", name, id);
          }
        }
        for (id, name) in &known_tasks {
          if !tasks.contains_key(id) {
            log::info!("Task {} ({}) removed", name, id);
          }
        }
        known_tasks = tasks;
      }
      Ok(()) = active_rx.changed() => {
        let now = dashboard.active_set();
        for id in now.difference(&recording) {
          log::info!("Recording started: {}", known_tasks.get(id).unwrap_or(id));
        }
        for id in recording.difference(&now) {
          log::info!("Recording finished: {}", known_tasks.get(id).unwrap_or(id));
        }
        recording = now;
      }
      Ok(()) = jobs_rx.changed() => {
        let table = dashboard.jobs().jobs();
        for (key, job) in &table {
          if jobs.get(key) != Some(job) {
            log::info!("Conversion {}: {:?} {:.0}%", key, job.status, job.progress);
          }
        }
        jobs = table;
      }
      Some(notice) = next_notice(&player) => {
        log::info!("Playback: {:?}", notice);
      }
    }
  }

  if let Some(player) = player {
    player.controller.close(|| log::debug!("Playback closed for shutdown"));
    player.mpv.shutdown().await;
  }
  dashboard.shutdown();
  Ok(())
}
