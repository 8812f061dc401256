//! Media kind resolution for play requests.

use std::fmt;

/// How a media reference has to be played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
  /// Finished recording in a container the element plays directly.
  RecordedProgressive,
  /// Raw transport stream, played through the server's remux endpoint.
  RecordedNeedingRemux,
  /// HLS manifest, played through an adaptive streaming session.
  LiveAdaptive,
}

impl MediaKind {
  pub fn is_adaptive(self) -> bool {
    self == MediaKind::LiveAdaptive
  }
}

impl fmt::Display for MediaKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      MediaKind::RecordedProgressive => "progressive",
      MediaKind::RecordedNeedingRemux => "remux",
      MediaKind::LiveAdaptive => "adaptive",
    })
  }
}

/// Path part of a reference: no query, no fragment, no trailing slash.
fn ref_path(media_ref: &str) -> &str {
  media_ref
    .split(|c| c == '?' || c == '#')
    .next()
    .unwrap_or(media_ref)
    .trim_end_matches('/')
}

/// Classify a media reference by its extension.
pub fn resolve_kind(media_ref: &str) -> MediaKind {
  let path = ref_path(media_ref).to_ascii_lowercase();
  if path.ends_with(".m3u8") {
    MediaKind::LiveAdaptive
  } else if path.ends_with(".ts") {
    MediaKind::RecordedNeedingRemux
  } else {
    MediaKind::RecordedProgressive
  }
}

/// One user "play" action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackRequest {
  pub media_ref: String,
  pub kind: MediaKind,
}

impl PlaybackRequest {
  pub fn new(media_ref: impl Into<String>) -> Self {
    let media_ref = media_ref.into();
    let kind = resolve_kind(&media_ref);
    Self { media_ref, kind }
  }

  /// Reference actually handed to the element or session.
  ///
  /// Transport streams go through the `/mp4` remux rendition of the recording.
  pub fn source_ref(&self) -> String {
    match self.kind {
      MediaKind::RecordedNeedingRemux => format!("{}/mp4", ref_path(&self.media_ref)),
      _ => self.media_ref.clone(),
    }
  }

  /// Source reference resolved against the API origin when relative.
  pub fn source_url(&self, origin: &str) -> String {
    let source = self.source_ref();
    if source.starts_with("http://") || source.starts_with("https://") || origin.is_empty() {
      return source;
    }
    let origin = origin.trim_end_matches('/');
    if source.starts_with('/') {
      format!("{}{}", origin, source)
    } else {
      format!("{}/{}", origin, source)
    }
  }
}
