//! Playback error types.

use thiserror::Error;

use super::backend::StreamFault;

#[derive(Debug, Error)]
pub enum PlaybackError {
  #[error("Failed to create streaming session: {0}")]
  SessionCreate(String),

  #[error("Failed to attach session to media element: {0}")]
  Attach(String),

  #[error("Failed to assign media source: {0}")]
  Source(String),

  #[error("Unrecoverable stream fault: {0}")]
  Unrecoverable(StreamFault),

  #[error("Player backend error: {0}")]
  Backend(String),
}
