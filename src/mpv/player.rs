//! MPV as the playback surface: a [`MediaElement`] plus an [`AdaptiveEngine`]
//! whose sessions let MPV's own HLS demuxer load the manifest.

use std::path::Path;
use std::process::Child;
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::ipc::{IpcError, MpvIpc};
use super::process::{cleanup_ipc, find_mpv, ipc_path, spawn_mpv, ProcessError};
use super::protocol::{EndReason, MpvCommand, MpvEvent};
use crate::api::redact_url;
use crate::playback::{
  AdaptiveEngine, AdaptiveSession, FaultClass, MediaElement, PlaybackError, SessionEvent, StreamFault,
};

#[derive(Error, Debug)]
pub enum MpvError {
  #[error("Process error: {0}")]
  Process(#[from] ProcessError),
  #[error("IPC error: {0}")]
  Ipc(#[from] IpcError),
  #[error("MPV command failed: {0}")]
  CommandFailed(String),
}

const NETWORK_MARKERS: &[&str] = &[
  "loading failed",
  "network",
  "http",
  "timed out",
  "timeout",
  "connection",
  "refused",
  "403",
  "404",
];

const MEDIA_MARKERS: &[&str] = &[
  "unrecognized file format",
  "no audio or video",
  "decod",
  "demux",
  "codec",
];

/// Classify the `file_error` text of an `end-file` event.
pub fn classify_fault(file_error: Option<&str>) -> FaultClass {
  let text = file_error.unwrap_or_default().to_ascii_lowercase();
  if NETWORK_MARKERS.iter().any(|m| text.contains(m)) {
    FaultClass::Network
  } else if MEDIA_MARKERS.iter().any(|m| text.contains(m)) {
    FaultClass::Media
  } else {
    FaultClass::Other
  }
}

/// Map an MPV event onto what an adaptive session reports, if anything.
pub fn session_event(event: &MpvEvent) -> Option<SessionEvent> {
  match event.end_reason() {
    Some(EndReason::Error) => {
      let details = event.file_error.clone().unwrap_or_else(|| "unknown error".to_string());
      Some(SessionEvent::Fault(StreamFault::new(
        classify_fault(event.file_error.as_deref()),
        details,
      )))
    }
    Some(EndReason::Eof) => Some(SessionEvent::Ended),
    Some(_) => None,
    None if event.event == "playback-restart" => Some(SessionEvent::Resumed),
    None => None,
  }
}

/// Decides which MPV events belong to the session that attached last.
///
/// Everything before the session's first `start-file` is left over from an
/// earlier source. After that, `end-file` events are only accepted for the
/// playlist entry MPV reported most recently.
#[derive(Debug, Default)]
struct EntryFilter {
  started: bool,
  entry: Option<i64>,
}

impl EntryFilter {
  fn admit(&mut self, event: &MpvEvent) -> bool {
    if event.event == "start-file" {
      self.started = true;
      self.entry = event.playlist_entry_id;
      return false;
    }
    if !self.started {
      return false;
    }
    match (event.end_reason(), self.entry, event.playlist_entry_id) {
      (Some(_), Some(current), Some(id)) => id == current,
      _ => true,
    }
  }
}

/// Handle to a running MPV instance.
pub struct MpvPlayer {
  ipc: MpvIpc,
  process: Mutex<Option<Child>>,
}

impl MpvPlayer {
  /// Spawn an idle MPV and connect to its IPC server.
  pub async fn launch(binary: Option<&Path>, extra_args: &[String]) -> Result<Self, MpvError> {
    let binary = find_mpv(binary).ok_or(ProcessError::NotFound)?;
    cleanup_ipc();
    let mut child = spawn_mpv(&binary, extra_args)?;

    // MPV needs a moment to create the socket.
    tokio::time::sleep(Duration::from_millis(300)).await;
    match MpvIpc::connect(&ipc_path(), 10).await {
      Ok(ipc) => {
        log::info!("MPV connected");
        Ok(Self::with_ipc(ipc, Some(child)))
      }
      Err(e) => {
        let _ = child.kill();
        Err(e.into())
      }
    }
  }

  pub(crate) fn with_ipc(ipc: MpvIpc, process: Option<Child>) -> Self {
    Self {
      ipc,
      process: Mutex::new(process),
    }
  }

  pub fn events(&self) -> Receiver<MpvEvent> {
    self.ipc.events()
  }

  fn post(&self, cmd: MpvCommand) -> Result<(), MpvError> {
    self.ipc.post(cmd).map_err(MpvError::from)
  }

  /// Check that MPV still answers commands.
  pub async fn ping(&self) -> Result<(), MpvError> {
    let response = self.ipc.send_command(MpvCommand::get_property("idle-active")).await?;
    if !response.is_success() {
      return Err(MpvError::CommandFailed(response.error));
    }
    Ok(())
  }

  /// Ask MPV to quit, then make sure the process is gone.
  pub async fn shutdown(&self) {
    if let Err(e) = self.ipc.send_command(MpvCommand::quit()).await {
      log::debug!("MPV quit command failed: {}", e);
    }
    self.ipc.close();

    let child = self.process.lock().take();
    if let Some(mut child) = child {
      let result = tokio::task::spawn_blocking(move || {
        let _ = child.kill();
        child.wait()
      })
      .await;
      match result {
        Ok(Ok(status)) => log::info!("MPV process exited with: {}", status),
        Ok(Err(e)) => log::error!("wait() failed: {}", e),
        Err(e) => log::error!("spawn_blocking panicked during MPV cleanup: {}", e),
      }
    }
    cleanup_ipc();
  }
}

impl MediaElement for MpvPlayer {
  fn assign_source(&self, url: &str) -> Result<(), PlaybackError> {
    log::info!("MPV loading {}", redact_url(url));
    self
      .post(MpvCommand::loadfile(url))
      .map_err(|e| PlaybackError::Source(e.to_string()))
  }

  fn clear_source(&self) {
    if let Err(e) = self.post(MpvCommand::stop()) {
      log::warn!("Failed to stop MPV playback: {}", e);
    }
  }
}

/// Creates [`MpvSession`]s on a shared player.
pub struct MpvAdaptiveEngine {
  player: Arc<MpvPlayer>,
}

impl MpvAdaptiveEngine {
  pub fn new(player: Arc<MpvPlayer>) -> Self {
    Self { player }
  }
}

impl AdaptiveEngine for MpvAdaptiveEngine {
  fn create(&self, manifest_url: &str) -> BoxFuture<'static, Result<Box<dyn AdaptiveSession>, PlaybackError>> {
    let player = self.player.clone();
    let url = manifest_url.to_string();
    async move {
      player
        .ping()
        .await
        .map_err(|e| PlaybackError::SessionCreate(e.to_string()))?;
      Ok(Box::new(MpvSession::new(player, url)) as Box<dyn AdaptiveSession>)
    }
    .boxed()
  }
}

/// One manifest playing on MPV.
pub struct MpvSession {
  player: Arc<MpvPlayer>,
  url: String,
  events_tx: Sender<SessionEvent>,
  events_rx: Receiver<SessionEvent>,
  forwarder: CancellationToken,
  destroyed: bool,
}

impl MpvSession {
  fn new(player: Arc<MpvPlayer>, url: String) -> Self {
    let (events_tx, events_rx) = async_channel::unbounded();
    Self {
      player,
      url,
      events_tx,
      events_rx,
      forwarder: CancellationToken::new(),
      destroyed: false,
    }
  }

  fn spawn_forwarder(&self) {
    let dropped = self.player.ipc.drain_events();
    if dropped > 0 {
      log::debug!("Discarded {} MPV events from earlier sources", dropped);
    }
    let mpv_events = self.player.events();
    let tx = self.events_tx.clone();
    let cancel = self.forwarder.clone();
    tokio::spawn(async move {
      let mut filter = EntryFilter::default();
      loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          event = mpv_events.recv() => {
            let Ok(event) = event else { break };
            if !filter.admit(&event) {
              log::trace!("Ignoring MPV {} not from this session", event.event);
              continue;
            }
            if let Some(mapped) = session_event(&event) {
              if tx.send(mapped).await.is_err() {
                break;
              }
            }
          }
        }
      }
    });
  }

  fn reload(&self) {
    if let Err(e) = self.player.post(MpvCommand::loadfile(&self.url)) {
      log::error!("Failed to reload {}: {}", redact_url(&self.url), e);
    }
  }
}

impl AdaptiveSession for MpvSession {
  fn attach(&mut self, element: &dyn MediaElement) -> Result<(), PlaybackError> {
    self.spawn_forwarder();
    element
      .assign_source(&self.url)
      .map_err(|e| PlaybackError::Attach(e.to_string()))
  }

  fn start_load(&mut self) {
    self.reload();
  }

  fn recover_media_error(&mut self) {
    // Software decoding is the usual way out of a hardware decoder failure.
    if let Err(e) = self.player.post(MpvCommand::set_property("hwdec", "no")) {
      log::warn!("Failed to disable hwdec: {}", e);
    }
    self.reload();
  }

  fn destroy(&mut self) {
    if self.destroyed {
      return;
    }
    self.destroyed = true;
    self.forwarder.cancel();
    self.events_tx.close();
    self.player.clear_source();
  }

  fn events(&self) -> Receiver<SessionEvent> {
    self.events_rx.clone()
  }
}

impl Drop for MpvSession {
  fn drop(&mut self) {
    self.forwarder.cancel();
  }
}
