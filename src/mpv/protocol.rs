//! MPV JSON IPC protocol types.
//!
//! Reference: https://mpv.io/manual/master/#json-ipc

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};

static REQUEST_ID: AtomicI64 = AtomicI64::new(1);

fn next_request_id() -> i64 {
  REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Command sent to MPV via IPC.
#[derive(Debug, Clone, Serialize)]
pub struct MpvCommand {
  pub command: Vec<Value>,
  pub request_id: i64,
}

impl MpvCommand {
  pub fn new(args: Vec<Value>) -> Self {
    Self {
      command: args,
      request_id: next_request_id(),
    }
  }

  /// Replace whatever is playing with `url`.
  pub fn loadfile(url: &str) -> Self {
    Self::new(vec!["loadfile".into(), url.into(), "replace".into()])
  }

  /// Unload the current file and go idle.
  pub fn stop() -> Self {
    Self::new(vec!["stop".into()])
  }

  pub fn set_property(name: &str, value: impl Into<Value>) -> Self {
    Self::new(vec!["set_property".into(), name.into(), value.into()])
  }

  pub fn get_property(name: &str) -> Self {
    Self::new(vec!["get_property".into(), name.into()])
  }

  pub fn quit() -> Self {
    Self::new(vec!["quit".into()])
  }
}

/// Response from MPV for a command.
#[derive(Debug, Clone, Deserialize)]
pub struct MpvResponse {
  /// "success" or an error message.
  pub error: String,
  pub data: Option<Value>,
  pub request_id: i64,
}

impl MpvResponse {
  pub fn is_success(&self) -> bool {
    self.error == "success"
  }
}

/// Why MPV stopped playing a file (`end-file` event).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
  Eof,
  Stop,
  Quit,
  Error,
  Redirect,
  Unknown,
}

impl EndReason {
  fn parse(reason: Option<&str>) -> Self {
    match reason {
      Some("eof") => EndReason::Eof,
      Some("stop") => EndReason::Stop,
      Some("quit") => EndReason::Quit,
      Some("error") => EndReason::Error,
      Some("redirect") => EndReason::Redirect,
      _ => EndReason::Unknown,
    }
  }
}

/// Event sent by MPV.
#[derive(Debug, Clone, Deserialize)]
pub struct MpvEvent {
  /// Event name, e.g. "end-file", "playback-restart", "file-loaded".
  pub event: String,
  pub reason: Option<String>,
  /// Error text for `end-file` events with reason "error".
  pub file_error: Option<String>,
  /// Playlist entry a `start-file`/`end-file` event refers to.
  pub playlist_entry_id: Option<i64>,
  pub name: Option<String>,
  pub data: Option<Value>,
}

impl MpvEvent {
  pub fn end_reason(&self) -> Option<EndReason> {
    (self.event == "end-file").then(|| EndReason::parse(self.reason.as_deref()))
  }
}

/// Line received over IPC: either a command response or an event.
#[derive(Debug, Clone)]
pub enum MpvMessage {
  Response(MpvResponse),
  Event(MpvEvent),
}

impl MpvMessage {
  pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
    let value: Value = serde_json::from_str(line)?;
    if value.get("event").is_some() {
      Ok(MpvMessage::Event(serde_json::from_value(value)?))
    } else {
      Ok(MpvMessage::Response(serde_json::from_value(value)?))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_loadfile_replaces() {
    let cmd = MpvCommand::loadfile("http://nas:8000/tasks/T/stream.m3u8");
    let json = serde_json::to_value(&cmd).unwrap();
    assert_eq!(
      json["command"],
      serde_json::json!(["loadfile", "http://nas:8000/tasks/T/stream.m3u8", "replace"])
    );
  }

  #[test]
  fn test_response_parsing() {
    let msg = MpvMessage::parse(r#"{"error":"success","data":null,"request_id":7}"#).unwrap();
    match msg {
      MpvMessage::Response(r) => {
        assert!(r.is_success());
        assert_eq!(r.request_id, 7);
      }
      _ => panic!("Expected response"),
    }
  }

  #[test]
  fn test_end_file_error_parsing() {
    let line = r#"{"event":"end-file","reason":"error","playlist_entry_id":1,"file_error":"loading failed"}"#;
    match MpvMessage::parse(line).unwrap() {
      MpvMessage::Event(e) => {
        assert_eq!(e.end_reason(), Some(EndReason::Error));
        assert_eq!(e.file_error.as_deref(), Some("loading failed"));
        assert_eq!(e.playlist_entry_id, Some(1));
      }
      _ => panic!("Expected event"),
    }
  }

  #[test]
  fn test_non_end_events_have_no_reason() {
    match MpvMessage::parse(r#"{"event":"playback-restart"}"#).unwrap() {
      MpvMessage::Event(e) => assert_eq!(e.end_reason(), None),
      _ => panic!("Expected event"),
    }
  }
}
