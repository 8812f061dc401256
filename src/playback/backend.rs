//! Seams between the playback controller and whatever actually decodes media.

use futures_util::future::BoxFuture;
use std::fmt;

use super::error::PlaybackError;

/// The surface video ends up on. Owned by exactly one controller.
pub trait MediaElement: Send + Sync {
  /// Point the element at a URL it can play without an adaptive session.
  fn assign_source(&self, url: &str) -> Result<(), PlaybackError>;

  /// Stop and unload whatever the element is playing. Idempotent.
  fn clear_source(&self);
}

/// Coarse class of an adaptive streaming fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultClass {
  /// Manifest or segment loading failed.
  Network,
  /// Decoder or demuxer failed on data that did load.
  Media,
  Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFault {
  pub class: FaultClass,
  pub details: String,
}

impl StreamFault {
  pub fn new(class: FaultClass, details: impl Into<String>) -> Self {
    Self {
      class,
      details: details.into(),
    }
  }
}

impl fmt::Display for StreamFault {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?} fault: {}", self.class, self.details)
  }
}

/// Events an adaptive session reports after it is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
  Fault(StreamFault),
  /// Playback is progressing again (first frame, or after a recovery).
  Resumed,
  /// The stream ended on its own.
  Ended,
}

/// A live adaptive streaming session (manifest + segments feeding the element).
pub trait AdaptiveSession: Send {
  /// Bind the session to the element and start loading the manifest.
  fn attach(&mut self, element: &dyn MediaElement) -> Result<(), PlaybackError>;

  /// Resume loading after a network fault, keeping the session.
  fn start_load(&mut self);

  /// Try to recover the decoder in place after a media fault.
  fn recover_media_error(&mut self);

  /// Detach from the element and release everything. Safe to call twice.
  fn destroy(&mut self);

  /// Event stream for this session. Closed once the session is destroyed.
  fn events(&self) -> async_channel::Receiver<SessionEvent>;
}

/// Factory for adaptive sessions. Construction may be slow (e.g. starting a player).
pub trait AdaptiveEngine: Send + Sync {
  fn create(&self, manifest_url: &str) -> BoxFuture<'static, Result<Box<dyn AdaptiveSession>, PlaybackError>>;
}
