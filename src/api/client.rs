//! HTTP client for the capture server's REST API.

use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::error::ApiError;
use super::types::*;

const USER_AGENT: &str = concat!("capture-deck/", env!("CARGO_PKG_VERSION"));

/// Query keys whose values must not reach the logs.
const SECRET_PARAMS: &[&str] = &["api_key", "apikey", "token", "access_token", "password", "secret"];

/// Copy of `url` with secret query values masked, for logging.
pub fn redact_url(url: &str) -> String {
  let Ok(mut parsed) = Url::parse(url) else {
    return url.to_string();
  };
  if parsed.query().is_none() {
    return url.to_string();
  }
  let pairs: Vec<(String, String)> = parsed
    .query_pairs()
    .map(|(k, v)| {
      let masked = SECRET_PARAMS.contains(&k.to_ascii_lowercase().as_str());
      (k.into_owned(), if masked { "***".to_string() } else { v.into_owned() })
    })
    .collect();
  parsed.query_pairs_mut().clear().extend_pairs(pairs);
  parsed.into()
}

/// Capture server HTTP API client.
#[derive(Debug, Clone)]
pub struct ApiClient {
  http: Client,
  base: Url,
}

impl ApiClient {
  /// Create a client for the server at `base_url`.
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
    let base_url = base_url.trim().trim_end_matches('/');
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
      return Err(ApiError::InvalidUrl(
        "URL must start with http:// or https://".to_string(),
      ));
    }
    let base = Url::parse(base_url).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;

    let http = Client::builder()
      .timeout(timeout)
      .user_agent(USER_AGENT)
      .build()?;

    Ok(Self { http, base })
  }

  /// Server origin (plus any path prefix), without a trailing slash.
  pub fn base_url(&self) -> &str {
    self.base.as_str().trim_end_matches('/')
  }

  /// Build an endpoint URL from raw path segments; each segment is percent-encoded.
  pub fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| ApiError::InvalidUrl(self.base.to_string()))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  /// Turn a non-2xx response into an error, logging the body.
  async fn ensure_success(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let url = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    log::error!("{} failed with status {}: {}", url, status, body);
    Err(ApiError::Status { status, body })
  }

  async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
    log::trace!("GET {}", url.path());
    let response = self.http.get(url).send().await?;
    let response = Self::ensure_success(response).await?;
    Ok(response.json().await?)
  }

  // ==========================================================================
  // Tasks
  // ==========================================================================

  pub async fn list_tasks(&self) -> Result<Vec<Task>, ApiError> {
    self.get(self.endpoint(&["tasks"])?).await
  }

  pub async fn create_task(&self, task: &Task) -> Result<Task, ApiError> {
    let url = self.endpoint(&["tasks"])?;
    log::debug!("POST {} ({})", url.path(), task.name);
    let response = self.http.post(url).json(task).send().await?;
    let response = Self::ensure_success(response).await?;
    Ok(response.json().await?)
  }

  pub async fn update_task(&self, task: &Task) -> Result<Task, ApiError> {
    let url = self.endpoint(&["tasks", &task.id])?;
    log::debug!("PUT {}", url.path());
    let response = self.http.put(url).json(task).send().await?;
    let response = Self::ensure_success(response).await?;
    Ok(response.json().await?)
  }

  pub async fn delete_task(&self, task_id: &str) -> Result<(), ApiError> {
    let url = self.endpoint(&["tasks", task_id])?;
    log::debug!("DELETE {}", url.path());
    let response = self.http.delete(url).send().await?;
    Self::ensure_success(response).await?;
    Ok(())
  }

  /// Stop the capture currently running for a task.
  pub async fn stop_recording(&self, task_id: &str) -> Result<(), ApiError> {
    let url = self.endpoint(&["tasks", task_id, "stop"])?;
    log::debug!("POST {}", url.path());
    let response = self.http.post(url).send().await?;
    Self::ensure_success(response).await?;
    Ok(())
  }

  /// IDs of the tasks that are capturing right now.
  pub async fn active_recordings(&self) -> Result<Vec<String>, ApiError> {
    self.get(self.endpoint(&["tasks", "active_recordings"])?).await
  }

  pub async fn get_logs(&self, task_id: &str) -> Result<Vec<LogEntry>, ApiError> {
    self.get(self.endpoint(&["tasks", task_id, "logs"])?).await
  }

  // ==========================================================================
  // Recordings
  // ==========================================================================

  /// Recordings of a task, newest first.
  pub async fn list_recordings(&self, task_id: &str) -> Result<Vec<Recording>, ApiError> {
    self
      .get(self.endpoint(&["tasks", task_id, "recordings"])?)
      .await
  }

  pub async fn delete_recording(&self, task_id: &str, filename: &str) -> Result<(), ApiError> {
    let url = self.endpoint(&["tasks", task_id, "recordings", filename])?;
    log::debug!("DELETE {}", url.path());
    let response = self.http.delete(url).send().await?;
    Self::ensure_success(response).await?;
    Ok(())
  }

  /// Ordered thumbnail image URLs for a recording.
  pub async fn list_thumbnails(&self, task_id: &str, filename: &str) -> Result<Vec<String>, ApiError> {
    self
      .get(self.endpoint(&["tasks", task_id, "recordings", filename, "thumbnails"])?)
      .await
  }

  /// URL of the raw recording file.
  pub fn recording_url(&self, task_id: &str, filename: &str) -> Result<String, ApiError> {
    Ok(
      self
        .endpoint(&["tasks", task_id, "recordings", filename])?
        .into(),
    )
  }

  /// URL of the remuxed MP4 rendition, optionally as an attachment download.
  pub fn remux_url(&self, task_id: &str, filename: &str, download: bool) -> Result<String, ApiError> {
    let mut url = self.endpoint(&["tasks", task_id, "recordings", filename, "mp4"])?;
    if download {
      url.query_pairs_mut().append_pair("download", "true");
    }
    Ok(url.into())
  }

  /// URL of a task's live HLS manifest.
  pub fn live_manifest_url(&self, task_id: &str) -> Result<String, ApiError> {
    Ok(self.endpoint(&["tasks", task_id, "stream.m3u8"])?.into())
  }

  // ==========================================================================
  // Transcoding
  // ==========================================================================

  /// Start a transcode of a recording.
  pub async fn convert_recording(
    &self,
    task_id: &str,
    filename: &str,
    quality: Quality,
  ) -> Result<ConvertResponse, ApiError> {
    let mut url = self.endpoint(&["tasks", task_id, "recordings", filename, "convert"])?;
    url.query_pairs_mut().append_pair("quality", quality.as_str());
    log::info!("POST {}?quality={}", url.path(), quality.as_str());

    let response = self.http.post(url).send().await?;
    let response = Self::ensure_success(response).await?;
    Ok(response.json().await?)
  }

  /// Conversion status for one job, or the full table when `key` is `None`.
  pub async fn conversion_status(&self, key: Option<&JobKey>) -> Result<ConversionTable, ApiError> {
    let mut url = self.endpoint(&["conversion_status"])?;
    if let Some(key) = key {
      url.query_pairs_mut().append_pair("task_key", key.as_str());
    }
    self.get(url).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use axum::extract::{Path, Query};
  use axum::http::StatusCode;
  use axum::routing::{get, post};
  use axum::{Json, Router};
  use std::collections::HashMap;

  async fn serve(router: Router) -> ApiClient {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, router).await.unwrap();
    });
    ApiClient::new(&format!("http://{}", addr), Duration::from_secs(5)).unwrap()
  }

  #[test]
  fn test_rejects_non_http_base() {
    let err = ApiClient::new("ftp://example.com", Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, ApiError::InvalidUrl(_)));
  }

  #[test]
  fn test_media_urls_are_encoded() {
    let client = ApiClient::new("http://nas:8000/", Duration::from_secs(1)).unwrap();
    assert_eq!(client.base_url(), "http://nas:8000");
    assert_eq!(
      client.remux_url("T", "my cam.ts", false).unwrap(),
      "http://nas:8000/tasks/T/recordings/my%20cam.ts/mp4"
    );
    assert_eq!(
      client.remux_url("T", "a.ts", true).unwrap(),
      "http://nas:8000/tasks/T/recordings/a.ts/mp4?download=true"
    );
    assert_eq!(
      client.live_manifest_url("T").unwrap(),
      "http://nas:8000/tasks/T/stream.m3u8"
    );
  }

  #[test]
  fn test_redacts_secret_query_values() {
    assert_eq!(
      redact_url("http://nas/tasks/1/stream.m3u8?api_key=hunter2&t=5"),
      "http://nas/tasks/1/stream.m3u8?api_key=***&t=5"
    );
    assert_eq!(redact_url("/relative/a.ts?token=x"), "/relative/a.ts?token=x");
    assert_eq!(redact_url("http://nas/a.mp4"), "http://nas/a.mp4");
  }

  #[test]
  fn test_base_path_prefix_is_kept() {
    let client = ApiClient::new("http://nas/api", Duration::from_secs(1)).unwrap();
    assert_eq!(
      client.recording_url("1", "b.mp4").unwrap(),
      "http://nas/api/tasks/1/recordings/b.mp4"
    );
  }

  #[tokio::test]
  async fn test_lists_recordings_and_active_set() {
    let router = Router::new()
      .route(
        "/tasks/:id/recordings",
        get(|Path(id): Path<String>| async move {
          assert_eq!(id, "T");
          Json(serde_json::json!([
            {"file": "a.ts", "size": 1024, "mtime": "2024-05-01T10:00:00"},
            {"file": "b.mp4", "size": 2048, "mtime": "2024-05-01T09:00:00"}
          ]))
        }),
      )
      .route(
        "/tasks/active_recordings",
        get(|| async { Json(serde_json::json!(["T"])) }),
      );
    let client = serve(router).await;

    let recordings = client.list_recordings("T").await.unwrap();
    assert_eq!(recordings.len(), 2);
    assert_eq!(recordings[0].file, "a.ts");
    assert_eq!(client.active_recordings().await.unwrap(), vec!["T".to_string()]);
  }

  #[tokio::test]
  async fn test_convert_sends_quality_and_status_filters_by_key() {
    let router = Router::new()
      .route(
        "/tasks/:id/recordings/:file/convert",
        post(
          |Path((id, file)): Path<(String, String)>, Query(q): Query<HashMap<String, String>>| async move {
            assert_eq!(q.get("quality").map(String::as_str), Some("high"));
            Json(serde_json::json!({"task_key": format!("{}_{}", id, file)}))
          },
        ),
      )
      .route(
        "/conversion_status",
        get(|Query(q): Query<HashMap<String, String>>| async move {
          let key = q.get("task_key").cloned().unwrap_or_default();
          let mut table = serde_json::Map::new();
          table.insert(key, serde_json::json!({"status": "processing", "progress": 42}));
          Json(serde_json::Value::Object(table))
        }),
      );
    let client = serve(router).await;

    let resp = client
      .convert_recording("5", "cam.ts", Quality::High)
      .await
      .unwrap();
    assert_eq!(resp.task_key.as_deref(), Some("5_cam.ts"));

    let table = client
      .conversion_status(Some(&JobKey::new("5", "cam.ts")))
      .await
      .unwrap();
    let job = &table["5_cam.ts"];
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.progress, 42.0);
  }

  #[tokio::test]
  async fn test_error_status_is_surfaced() {
    let router = Router::new().route(
      "/tasks/:id/stop",
      post(|| async { (StatusCode::NOT_FOUND, "no such task") }),
    );
    let client = serve(router).await;

    let err = client.stop_recording("missing").await.unwrap_err();
    assert_eq!(err.status(), Some(reqwest::StatusCode::NOT_FOUND));
    match err {
      ApiError::Status { body, .. } => assert_eq!(body, "no such task"),
      other => panic!("Expected status error, got {:?}", other),
    }
  }
}
