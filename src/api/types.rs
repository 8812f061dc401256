//! Capture server API types.
//!
//! These mirror the JSON bodies of the capture server's REST endpoints.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// A scheduled capture task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
  pub id: String,
  pub name: String,
  /// Stream page or playlist URL handed to the capture tool.
  pub url: String,
  /// Capture interval in minutes.
  pub interval: u32,
  /// Directory (relative to the server's recordings root).
  pub save_dir: String,
  /// Extra capture tool arguments, whitespace separated.
  #[serde(default)]
  pub params: Option<String>,
}

impl Task {
  /// Build a new task with a client-generated ID.
  pub fn new(name: impl Into<String>, url: impl Into<String>, interval: u32, save_dir: impl Into<String>) -> Self {
    Self {
      id: Uuid::new_v4().simple().to_string(),
      name: name.into(),
      url: url.into(),
      interval,
      save_dir: save_dir.into(),
      params: None,
    }
  }
}

/// A recorded file belonging to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
  pub file: String,
  /// Size in bytes.
  #[serde(default)]
  pub size: u64,
  /// ISO-8601 modification time.
  #[serde(alias = "timestamp", default)]
  pub mtime: String,
}

impl Recording {
  /// Whether the file is a raw transport stream that needs remuxing to play.
  pub fn is_transport_stream(&self) -> bool {
    self.file.to_ascii_lowercase().ends_with(".ts")
  }
}

/// One line of a task's run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
  pub time: String,
  /// Event name ("start", "end", "error", "no_stream", "mp4", ...).
  pub event: String,
  #[serde(default)]
  pub msg: String,
}

impl LogEntry {
  pub fn is_error(&self) -> bool {
    self.event == "error"
  }
}

/// Transcode job status as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  Pending,
  Processing,
  Completed,
  Failed,
}

impl JobStatus {
  pub fn is_finished(self) -> bool {
    matches!(self, JobStatus::Completed | JobStatus::Failed)
  }
}

/// A transcode job record. Always replaced as a whole, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionJob {
  pub status: JobStatus,
  /// Percent complete, 0-100.
  #[serde(default)]
  pub progress: f32,
  /// Source size in MB.
  #[serde(rename = "original_size", default)]
  pub original_size_mb: Option<f64>,
  /// Output size in MB.
  #[serde(rename = "new_size", default)]
  pub new_size_mb: Option<f64>,
}

impl ConversionJob {
  /// Record shown between a successful trigger and the first status poll.
  pub fn optimistic() -> Self {
    Self {
      status: JobStatus::Processing,
      progress: 0.0,
      original_size_mb: None,
      new_size_mb: None,
    }
  }
}

/// Full conversion status table keyed by job key.
pub type ConversionTable = HashMap<String, ConversionJob>;

/// Identifier of a transcode job: `{task_id}_{filename}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
  pub fn new(task_id: &str, filename: &str) -> Self {
    Self(format!("{}_{}", task_id, filename))
  }

  /// Wrap a key returned by the server verbatim.
  pub fn from_server(key: impl Into<String>) -> Self {
    Self(key.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for JobKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Output quality requested for a transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
  Low,
  #[default]
  Medium,
  High,
}

impl Quality {
  pub fn as_str(self) -> &'static str {
    match self {
      Quality::Low => "low",
      Quality::Medium => "medium",
      Quality::High => "high",
    }
  }
}

/// Response to a convert request.
#[derive(Debug, Clone, Deserialize)]
pub struct ConvertResponse {
  #[serde(default)]
  pub task_key: Option<String>,
}
