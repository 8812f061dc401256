//! Dashboard facade: keeps the task list, active set, focused task and job
//! table mirrored, and forwards mutations to the server.

use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::api::{ApiClient, ApiError, JobKey, LogEntry, Quality, Recording, Task};
use crate::config::AppConfig;
use crate::jobs::JobBoard;
use crate::playback::PlaybackRequest;
use crate::sync::{FetchFn, PollHandle, PollTarget, Snapshot, TargetedPoller};

#[derive(Error, Debug)]
pub enum DashboardError {
  #[error("{action} failed: {source}")]
  Mutation {
    action: &'static str,
    source: ApiError,
  },
  #[error(transparent)]
  Api(#[from] ApiError),
}

/// One row of the task table.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOverview {
  pub task: Task,
  /// Whether the server reports the task as currently recording.
  pub recording: bool,
  /// Known only for the focused task.
  pub recording_count: Option<usize>,
  pub latest_recording: Option<Recording>,
}

fn mutation<T>(action: &'static str, result: Result<T, ApiError>) -> Result<T, DashboardError> {
  result.map_err(|source| {
    log::error!("{} failed: {}", action, source);
    DashboardError::Mutation { action, source }
  })
}

fn task_id(target: &PollTarget) -> &str {
  match target {
    PollTarget::Recordings { task_id } | PollTarget::Logs { task_id } => task_id,
    _ => "",
  }
}

pub struct Dashboard {
  client: ApiClient,
  tasks: PollHandle<Vec<Task>>,
  active: PollHandle<Vec<String>>,
  recordings: Mutex<TargetedPoller<Vec<Recording>>>,
  logs: Mutex<TargetedPoller<Vec<LogEntry>>>,
  jobs: JobBoard,
  default_quality: Quality,
}

impl Dashboard {
  /// Start the always-on pollers. Must be called from within a tokio runtime.
  pub fn start(client: ApiClient, config: &AppConfig) -> Self {
    let c = client.clone();
    let tasks = PollHandle::start(PollTarget::Tasks, config.task_interval(), move |_: &PollTarget| {
      let c = c.clone();
      async move { c.list_tasks().await }.boxed()
    });

    let c = client.clone();
    let active = PollHandle::start(PollTarget::ActiveSet, config.task_interval(), move |_: &PollTarget| {
      let c = c.clone();
      async move { c.active_recordings().await }.boxed()
    });

    let c = client.clone();
    let recordings_fetch: FetchFn<Vec<Recording>> = Arc::new(move |target: &PollTarget| {
      let c = c.clone();
      let id = task_id(target).to_string();
      async move { c.list_recordings(&id).await }.boxed()
    });

    let c = client.clone();
    let logs_fetch: FetchFn<Vec<LogEntry>> = Arc::new(move |target: &PollTarget| {
      let c = c.clone();
      let id = task_id(target).to_string();
      async move { c.get_logs(&id).await }.boxed()
    });

    let jobs = JobBoard::start(client.clone(), config.conversion_interval());
    log::info!("Dashboard started against {}", client.base_url());

    Self {
      client,
      tasks,
      active,
      recordings: Mutex::new(TargetedPoller::new(config.recordings_interval(), recordings_fetch)),
      logs: Mutex::new(TargetedPoller::new(config.logs_interval(), logs_fetch)),
      jobs,
      default_quality: config.default_quality,
    }
  }

  pub fn client(&self) -> &ApiClient {
    &self.client
  }

  pub fn jobs(&self) -> &JobBoard {
    &self.jobs
  }

  pub fn tasks(&self) -> Option<Snapshot<Vec<Task>>> {
    self.tasks.current()
  }

  pub fn subscribe_tasks(&self) -> watch::Receiver<Option<Snapshot<Vec<Task>>>> {
    self.tasks.subscribe()
  }

  pub fn subscribe_active(&self) -> watch::Receiver<Option<Snapshot<Vec<String>>>> {
    self.active.subscribe()
  }

  /// Task IDs the server reports as currently recording.
  pub fn active_set(&self) -> HashSet<String> {
    self
      .active
      .current()
      .map(|s| s.value.iter().cloned().collect())
      .unwrap_or_default()
  }

  pub fn is_recording(&self, task_id: &str) -> bool {
    self
      .active
      .current()
      .is_some_and(|s| s.value.iter().any(|id| id == task_id))
  }

  /// Start mirroring recordings and logs of `task_id`, dropping the previous focus.
  pub fn focus_task(&self, task_id: &str) {
    log::debug!("Focusing task {}", task_id);
    self.recordings.lock().switch(PollTarget::Recordings {
      task_id: task_id.to_string(),
    });
    self.logs.lock().switch(PollTarget::Logs {
      task_id: task_id.to_string(),
    });
  }

  pub fn clear_focus(&self) {
    self.recordings.lock().clear();
    self.logs.lock().clear();
  }

  pub fn focused_task(&self) -> Option<String> {
    self.recordings.lock().target().map(|t| task_id(t).to_string())
  }

  pub fn recordings(&self) -> Option<Snapshot<Vec<Recording>>> {
    self.recordings.lock().current()
  }

  pub fn logs(&self) -> Option<Snapshot<Vec<LogEntry>>> {
    self.logs.lock().current()
  }

  /// Task list joined with the active set and the focused task's recordings.
  pub fn overview(&self) -> Vec<TaskOverview> {
    let Some(tasks) = self.tasks.current() else {
      return Vec::new();
    };
    let active = self.active_set();
    let focused = self.focused_task();
    let recordings = self.recordings();

    tasks
      .value
      .iter()
      .map(|task| {
        let own = recordings
          .as_ref()
          .filter(|_| focused.as_deref() == Some(task.id.as_str()));
        TaskOverview {
          task: task.clone(),
          recording: active.contains(&task.id),
          recording_count: own.map(|s| s.value.len()),
          latest_recording: own.and_then(|s| s.value.iter().max_by(|a, b| a.mtime.cmp(&b.mtime)).cloned()),
        }
      })
      .collect()
  }

  /// Playback request for a recorded file.
  pub fn recording_request(&self, task_id: &str, filename: &str) -> Result<PlaybackRequest, DashboardError> {
    Ok(PlaybackRequest::new(self.client.recording_url(task_id, filename)?))
  }

  /// Playback request for a task's live stream.
  pub fn live_request(&self, task_id: &str) -> Result<PlaybackRequest, DashboardError> {
    Ok(PlaybackRequest::new(self.client.live_manifest_url(task_id)?))
  }

  // ==========================================================================
  // Mutations
  // ==========================================================================

  pub async fn create_task(&self, task: &Task) -> Result<Task, DashboardError> {
    mutation("create task", self.client.create_task(task).await)
  }

  pub async fn update_task(&self, task: &Task) -> Result<Task, DashboardError> {
    mutation("update task", self.client.update_task(task).await)
  }

  pub async fn delete_task(&self, task_id: &str) -> Result<(), DashboardError> {
    mutation("delete task", self.client.delete_task(task_id).await)?;
    if self.focused_task().as_deref() == Some(task_id) {
      self.clear_focus();
    }
    Ok(())
  }

  pub async fn stop_recording(&self, task_id: &str) -> Result<(), DashboardError> {
    mutation("stop recording", self.client.stop_recording(task_id).await)
  }

  pub async fn delete_recording(&self, task_id: &str, filename: &str) -> Result<(), DashboardError> {
    mutation(
      "delete recording",
      self.client.delete_recording(task_id, filename).await,
    )
  }

  pub async fn thumbnails(&self, task_id: &str, filename: &str) -> Result<Vec<String>, DashboardError> {
    mutation("list thumbnails", self.client.list_thumbnails(task_id, filename).await)
  }

  /// Transcode a recording at `quality`, or the configured default.
  pub async fn convert(
    &self,
    task_id: &str,
    filename: &str,
    quality: Option<Quality>,
  ) -> Result<JobKey, DashboardError> {
    let quality = quality.unwrap_or(self.default_quality);
    mutation("convert recording", self.jobs.trigger(task_id, filename, quality).await)
  }

  /// Stop every poller. Results still in flight are discarded.
  pub fn shutdown(&self) {
    if !self.is_running() {
      return;
    }
    self.clear_focus();
    self.tasks.stop();
    self.active.stop();
    self.jobs.stop();
    log::info!("Dashboard stopped");
  }

  pub fn is_running(&self) -> bool {
    self.tasks.is_running()
  }
}

impl Drop for Dashboard {
  fn drop(&mut self) {
    self.shutdown();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use axum::extract::Path;
  use axum::http::StatusCode;
  use axum::routing::{get, post};
  use axum::{Json, Router};
  use std::time::Duration;

  fn fast_config() -> AppConfig {
    AppConfig {
      task_interval_ms: 20,
      recordings_interval_ms: 20,
      logs_interval_ms: 20,
      conversion_interval_ms: 20,
      ..AppConfig::default()
    }
  }

  async fn serve(router: Router) -> ApiClient {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, router).await.unwrap();
    });
    ApiClient::new(&format!("http://{}", addr), Duration::from_secs(5)).unwrap()
  }

  fn server() -> Router {
    Router::new()
      .route(
        "/tasks",
        get(|| async {
          Json(serde_json::json!([
            {"id": "T", "name": "Front door", "url": "http://cam/t", "interval": 5, "save_dir": "t"},
            {"id": "U", "name": "Garage", "url": "http://cam/u", "interval": 10, "save_dir": "u"}
          ]))
        }),
      )
      .route("/tasks/active_recordings", get(|| async { Json(serde_json::json!(["T"])) }))
      .route(
        "/tasks/:id/recordings",
        get(|Path(id): Path<String>| async move {
          if id == "T" {
            Json(serde_json::json!([
              {"file": "a.ts", "size": 10, "mtime": "2024-05-01T10:00:00"},
              {"file": "b.mp4", "size": 20, "mtime": "2024-05-01T09:00:00"}
            ]))
          } else {
            Json(serde_json::json!([]))
          }
        }),
      )
      .route(
        "/tasks/:id/logs",
        get(|| async { Json(serde_json::json!([{"time": "2024-05-01T10:00:00", "event": "start"}])) }),
      )
      .route("/conversion_status", get(|| async { Json(serde_json::json!({})) }))
      .route(
        "/tasks/:id/stop",
        post(|| async { (StatusCode::NOT_FOUND, "no such task") }),
      )
  }

  async fn wait_until(mut ready: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
      while !ready() {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();
  }

  #[tokio::test]
  async fn test_overview_joins_active_set_and_focused_recordings() {
    let dashboard = Dashboard::start(serve(server()).await, &fast_config());
    dashboard.focus_task("T");
    wait_until(|| {
      dashboard.tasks().is_some() && dashboard.recordings().is_some() && !dashboard.active_set().is_empty()
    })
    .await;

    let overview = dashboard.overview();
    assert_eq!(overview.len(), 2);
    let t = &overview[0];
    assert!(t.recording);
    assert_eq!(t.recording_count, Some(2));
    assert_eq!(t.latest_recording.as_ref().map(|r| r.file.as_str()), Some("a.ts"));
    let u = &overview[1];
    assert!(!u.recording);
    assert_eq!(u.recording_count, None);
  }

  #[tokio::test]
  async fn test_focus_switch_retargets_recordings_and_logs() {
    let dashboard = Dashboard::start(serve(server()).await, &fast_config());
    dashboard.focus_task("T");
    wait_until(|| dashboard.logs().is_some()).await;

    dashboard.focus_task("U");
    assert_eq!(dashboard.focused_task().as_deref(), Some("U"));
    assert!(dashboard.recordings().is_none());
    wait_until(|| dashboard.recordings().is_some()).await;
    assert!(dashboard.recordings().unwrap().value.is_empty());

    dashboard.clear_focus();
    assert_eq!(dashboard.focused_task(), None);
    assert!(dashboard.logs().is_none());
  }

  #[tokio::test]
  async fn test_failed_mutation_is_wrapped() {
    let dashboard = Dashboard::start(serve(server()).await, &fast_config());
    let err = dashboard.stop_recording("T").await.unwrap_err();
    match err {
      DashboardError::Mutation { action, source } => {
        assert_eq!(action, "stop recording");
        assert_eq!(source.status(), Some(reqwest::StatusCode::NOT_FOUND));
      }
      other => panic!("Expected mutation error, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_playback_requests_use_server_urls() {
    let dashboard = Dashboard::start(serve(server()).await, &fast_config());
    let request = dashboard.recording_request("T", "a.ts").unwrap();
    assert!(request.source_ref().ends_with("/tasks/T/recordings/a.ts/mp4"));
    assert!(dashboard.live_request("T").unwrap().kind.is_adaptive());
  }

  #[tokio::test]
  async fn test_shutdown_stops_pollers() {
    let dashboard = Dashboard::start(serve(server()).await, &fast_config());
    dashboard.focus_task("T");
    dashboard.shutdown();
    assert!(!dashboard.is_running());
    assert_eq!(dashboard.focused_task(), None);
  }
}
