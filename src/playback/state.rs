//! Playback session state machine.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackState {
  Idle,
  /// Request accepted; source assignment or session construction underway.
  Opening,
  /// Adaptive session exists and is being bound to the element.
  Attaching,
  Playing,
  /// A recoverable fault was reported and recovery was requested.
  Recovering,
  /// Tearing down the current session.
  Closing,
  /// The last request failed for good. The next request starts over.
  Failed,
}

/// Inputs that drive [`PlaybackState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
  Open,
  SourceAssigned,
  SessionCreated,
  Attached,
  RecoverableFault,
  Resumed,
  UnrecoverableFault,
  Close,
  Destroyed,
}

impl PlaybackState {
  /// Transition table. `None` means the input is not valid in this state.
  pub fn next(self, input: Input) -> Option<PlaybackState> {
    use Input::*;
    use PlaybackState::*;

    match (self, input) {
      (Idle | Failed, Open) => Some(Opening),
      (Opening, SourceAssigned) => Some(Playing),
      (Opening, SessionCreated) => Some(Attaching),
      (Attaching, Attached) => Some(Playing),
      (Playing | Recovering, RecoverableFault) => Some(Recovering),
      (Playing | Recovering, Resumed) => Some(Playing),
      (Opening | Attaching | Playing | Recovering, UnrecoverableFault) => Some(Failed),
      (Opening | Attaching | Playing | Recovering | Failed, Close) => Some(Closing),
      (Closing, Destroyed) => Some(Idle),
      _ => None,
    }
  }

  /// Whether a session (or a source assignment) may be live in this state.
  pub fn is_active(self) -> bool {
    !matches!(self, PlaybackState::Idle | PlaybackState::Failed)
  }
}

impl fmt::Display for PlaybackState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_adaptive_happy_path() {
    let s = PlaybackState::Idle;
    let s = s.next(Input::Open).unwrap();
    let s = s.next(Input::SessionCreated).unwrap();
    let s = s.next(Input::Attached).unwrap();
    assert_eq!(s, PlaybackState::Playing);
    let s = s.next(Input::RecoverableFault).unwrap();
    assert_eq!(s, PlaybackState::Recovering);
    assert_eq!(s.next(Input::Resumed), Some(PlaybackState::Playing));
  }

  #[test]
  fn test_failed_reopens_and_closes() {
    assert_eq!(PlaybackState::Failed.next(Input::Open), Some(PlaybackState::Opening));
    assert_eq!(PlaybackState::Failed.next(Input::Close), Some(PlaybackState::Closing));
    assert_eq!(PlaybackState::Closing.next(Input::Destroyed), Some(PlaybackState::Idle));
  }

  #[test]
  fn test_invalid_inputs_are_rejected() {
    assert_eq!(PlaybackState::Idle.next(Input::Close), None);
    assert_eq!(PlaybackState::Playing.next(Input::Open), None);
    assert_eq!(PlaybackState::Idle.next(Input::Resumed), None);
    assert_eq!(PlaybackState::Opening.next(Input::Attached), None);
  }
}
