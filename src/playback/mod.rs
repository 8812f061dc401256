//! Media playback: kind resolution, the session state machine and the controller
//! that owns the one session bound to the host element.

mod backend;
mod controller;
mod error;
mod media;
mod state;

pub use backend::{AdaptiveEngine, AdaptiveSession, FaultClass, MediaElement, SessionEvent, StreamFault};
pub use controller::{OpenOutcome, PlaybackController, PlaybackNotice};
pub use error::PlaybackError;
pub use media::{resolve_kind, MediaKind, PlaybackRequest};
pub use state::{Input, PlaybackState};
