//! Capture server error types.

use thiserror::Error;

/// Errors that can occur when talking to the capture server.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("HTTP request failed: {0}")]
  Http(#[from] reqwest::Error),

  #[error("HTTP {status}: {body}")]
  Status {
    status: reqwest::StatusCode,
    body: String,
  },

  #[error("JSON serialization error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("Invalid server URL: {0}")]
  InvalidUrl(String),

  #[error("Server response missing field: {0}")]
  MissingField(&'static str),
}

impl ApiError {
  /// HTTP status of the failed request, if the server answered at all.
  pub fn status(&self) -> Option<reqwest::StatusCode> {
    match self {
      ApiError::Status { status, .. } => Some(*status),
      ApiError::Http(e) => e.status(),
      _ => None,
    }
  }
}
