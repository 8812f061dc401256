//! Async IPC connection to MPV.
//!
//! One reader task routes responses to waiting callers and events to a channel;
//! one writer task serializes all outgoing commands.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;

use super::protocol::{MpvCommand, MpvEvent, MpvMessage, MpvResponse};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Events kept while nobody is reading; older ones are displaced.
const EVENT_BACKLOG: usize = 64;

#[derive(Error, Debug)]
pub enum IpcError {
  #[error("Connection failed: {0}")]
  ConnectionFailed(String),
  #[error("Failed to encode command: {0}")]
  Encode(#[from] serde_json::Error),
  #[error("Command timeout")]
  Timeout,
  #[error("Disconnected")]
  Disconnected,
}

type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<MpvResponse>>>>;

/// MPV IPC connection.
pub struct MpvIpc {
  pending: Pending,
  write_tx: Sender<Vec<u8>>,
  event_rx: Receiver<MpvEvent>,
}

impl MpvIpc {
  /// Connect to the IPC socket/pipe, retrying while MPV starts up.
  pub async fn connect(path: &str, attempts: u32) -> Result<Self, IpcError> {
    let mut last_error = IpcError::ConnectionFailed(format!("no attempt made on {}", path));

    for attempt in 0..attempts {
      if attempt > 0 {
        tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
      }
      match Self::try_connect(path).await {
        Ok(ipc) => return Ok(ipc),
        Err(e) => {
          log::debug!("IPC connect attempt {} failed: {}", attempt + 1, e);
          last_error = e;
        }
      }
    }

    Err(last_error)
  }

  #[cfg(windows)]
  async fn try_connect(path: &str) -> Result<Self, IpcError> {
    use tokio::net::windows::named_pipe::ClientOptions;

    let client = ClientOptions::new()
      .open(path)
      .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;
    let (reader, writer) = tokio::io::split(client);
    Ok(Self::spawn(reader, writer))
  }

  #[cfg(not(windows))]
  async fn try_connect(path: &str) -> Result<Self, IpcError> {
    let stream = tokio::net::UnixStream::connect(path)
      .await
      .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;
    let (reader, writer) = tokio::io::split(stream);
    Ok(Self::spawn(reader, writer))
  }

  /// Wire up reader and writer tasks over an established stream.
  pub(crate) fn spawn<R, W>(reader: R, writer: W) -> Self
  where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
    W: tokio::io::AsyncWrite + Send + Unpin + 'static,
  {
    let pending: Pending = Arc::default();
    let (event_tx, event_rx) = async_channel::bounded(EVENT_BACKLOG);
    let (write_tx, write_rx) = async_channel::unbounded();

    tokio::spawn(Self::reader_loop(reader, pending.clone(), event_tx));
    tokio::spawn(Self::writer_loop(writer, write_rx));

    Self {
      pending,
      write_tx,
      event_rx,
    }
  }

  async fn reader_loop<R: tokio::io::AsyncRead + Unpin>(
    reader: R,
    pending: Pending,
    event_tx: Sender<MpvEvent>,
  ) {
    let mut lines = BufReader::new(reader).lines();
    loop {
      match lines.next_line().await {
        Ok(Some(line)) => {
          let line = line.trim();
          if line.is_empty() {
            continue;
          }
          match MpvMessage::parse(line) {
            Ok(MpvMessage::Response(response)) => {
              if let Some(tx) = pending.lock().remove(&response.request_id) {
                let _ = tx.send(response);
              }
            }
            Ok(MpvMessage::Event(event)) => {
              log::debug!("MPV event: {}", event.event);
              match event_tx.force_send(event) {
                Ok(Some(old)) => log::trace!("MPV event backlog full, dropped {}", old.event),
                Ok(None) => {}
                Err(_) => break,
              }
            }
            Err(e) => log::warn!("Failed to parse MPV message: {} - {}", e, line),
          }
        }
        Ok(None) => {
          log::info!("MPV IPC connection closed");
          break;
        }
        Err(e) => {
          log::error!("MPV IPC read error: {}", e);
          break;
        }
      }
    }
    // Fail anyone still waiting.
    pending.lock().clear();
  }

  async fn writer_loop<W: tokio::io::AsyncWrite + Unpin>(mut writer: W, write_rx: Receiver<Vec<u8>>) {
    while let Ok(mut data) = write_rx.recv().await {
      data.push(b'\n');
      if let Err(e) = writer.write_all(&data).await {
        log::error!("MPV IPC write error: {}", e);
        break;
      }
      if let Err(e) = writer.flush().await {
        log::error!("MPV IPC flush error: {}", e);
        break;
      }
    }
    log::debug!("MPV IPC writer stopped");
  }

  /// Send a command and wait for MPV's response.
  pub async fn send_command(&self, cmd: MpvCommand) -> Result<MpvResponse, IpcError> {
    let request_id = cmd.request_id;
    let json = serde_json::to_vec(&cmd)?;

    let (tx, rx) = oneshot::channel();
    self.pending.lock().insert(request_id, tx);

    if self.write_tx.send(json).await.is_err() {
      self.pending.lock().remove(&request_id);
      return Err(IpcError::Disconnected);
    }

    match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
      Ok(Ok(response)) => Ok(response),
      Ok(Err(_)) => Err(IpcError::Disconnected),
      Err(_) => {
        log::error!("MPV command timed out, request_id={}", request_id);
        self.pending.lock().remove(&request_id);
        Err(IpcError::Timeout)
      }
    }
  }

  /// Queue a command without waiting for the response.
  pub fn post(&self, cmd: MpvCommand) -> Result<(), IpcError> {
    let json = serde_json::to_vec(&cmd)?;
    self.write_tx.try_send(json).map_err(|_| IpcError::Disconnected)
  }

  pub fn events(&self) -> Receiver<MpvEvent> {
    self.event_rx.clone()
  }

  /// Discard queued events. Returns how many were dropped.
  pub fn drain_events(&self) -> usize {
    let mut dropped = 0;
    while self.event_rx.try_recv().is_ok() {
      dropped += 1;
    }
    dropped
  }

  pub fn close(&self) {
    self.write_tx.close();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn test_response_routed_to_caller_and_events_to_channel() {
    let (client, server) = duplex(4096);
    let (client_r, client_w) = tokio::io::split(client);
    let ipc = MpvIpc::spawn(client_r, client_w);
    let events = ipc.events();

    let (server_r, mut server_w) = tokio::io::split(server);
    tokio::spawn(async move {
      let mut lines = BufReader::new(server_r).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        let cmd: serde_json::Value = serde_json::from_str(&line).unwrap();
        let id = cmd["request_id"].as_i64().unwrap();
        let reply = format!(
          "{{\"event\":\"playback-restart\"}}\n{{\"error\":\"success\",\"data\":true,\"request_id\":{}}}\n",
          id
        );
        server_w.write_all(reply.as_bytes()).await.unwrap();
      }
    });

    let response = ipc.send_command(MpvCommand::get_property("idle-active")).await.unwrap();
    assert!(response.is_success());
    assert_eq!(response.data, Some(serde_json::Value::Bool(true)));
    assert_eq!(events.recv().await.unwrap().event, "playback-restart");
  }

  #[tokio::test]
  async fn test_unread_events_are_capped_and_drainable() {
    let (client, mut server) = duplex(64 * 1024);
    let (client_r, client_w) = tokio::io::split(client);
    let ipc = MpvIpc::spawn(client_r, client_w);
    let events = ipc.events();

    let cmd = MpvCommand::get_property("idle-active");
    let mut burst = String::new();
    for i in 0..EVENT_BACKLOG + 10 {
      burst.push_str(&format!("{{\"event\":\"tick-{}\"}}\n", i));
    }
    burst.push_str("{\"event\":\"last\"}\n");
    // The reply comes after every event, so they have all been queued once it lands.
    burst.push_str(&format!(
      "{{\"error\":\"success\",\"data\":null,\"request_id\":{}}}\n",
      cmd.request_id
    ));

    let (response, written) = tokio::join!(ipc.send_command(cmd), server.write_all(burst.as_bytes()));
    written.unwrap();
    assert!(response.unwrap().is_success());

    assert_eq!(events.len(), EVENT_BACKLOG);
    assert_eq!(events.try_recv().unwrap().event, "tick-11");
    assert_eq!(ipc.drain_events(), EVENT_BACKLOG - 1);
    assert!(events.is_empty());
  }

  #[tokio::test]
  async fn test_closed_connection_fails_pending_command() {
    let (client, server) = duplex(4096);
    let (client_r, client_w) = tokio::io::split(client);
    let ipc = MpvIpc::spawn(client_r, client_w);
    drop(server);

    let result = ipc.send_command(MpvCommand::stop()).await;
    assert!(matches!(result, Err(IpcError::Disconnected)));
  }
}
