//! Conversion jobs: trigger a transcode, then join the optimistic record it
//! seeds with the polled status table.

use futures_util::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;

use crate::api::{ApiClient, ApiError, ConversionJob, ConversionTable, JobKey, Quality};
use crate::sync::{PollHandle, PollTarget, Snapshot};

/// Optimistic record plus the last fetch sequence issued when it was seeded.
#[derive(Debug, Clone)]
struct Seed {
  job: ConversionJob,
  after_sequence: u64,
}

pub struct JobBoard {
  client: ApiClient,
  status: PollHandle<ConversionTable>,
  seeds: RwLock<HashMap<JobKey, Seed>>,
}

impl JobBoard {
  /// Start polling the full conversion table every `interval`.
  pub fn start(client: ApiClient, interval: Duration) -> Self {
    let fetch_client = client.clone();
    let status = PollHandle::start(PollTarget::ConversionStatus, interval, move |_: &PollTarget| {
      let client = fetch_client.clone();
      async move { client.conversion_status(None).await }.boxed()
    });
    Self::with_status(client, status)
  }

  pub fn with_status(client: ApiClient, status: PollHandle<ConversionTable>) -> Self {
    Self {
      client,
      status,
      seeds: RwLock::new(HashMap::new()),
    }
  }

  /// Ask the server to transcode a recording and show it as processing right away.
  ///
  /// Nothing is recorded when the request fails.
  pub async fn trigger(&self, task_id: &str, filename: &str, quality: Quality) -> Result<JobKey, ApiError> {
    let response = self.client.convert_recording(task_id, filename, quality).await?;
    let key = match response.task_key {
      Some(key) => JobKey::from_server(key),
      None => JobKey::new(task_id, filename),
    };

    let after_sequence = self.status.last_issued_sequence();
    self.seeds.write().insert(
      key.clone(),
      Seed {
        job: ConversionJob::optimistic(),
        after_sequence,
      },
    );
    log::info!("Conversion of {} queued as {} ({})", filename, key, quality.as_str());
    Ok(key)
  }

  /// Drop seeds that a snapshot issued after them has answered.
  fn settle(&self, snapshot: &Option<Snapshot<ConversionTable>>) {
    let Some(snapshot) = snapshot else {
      return;
    };
    let answered = |key: &JobKey, seed: &Seed| {
      snapshot.sequence > seed.after_sequence && snapshot.value.contains_key(key.as_str())
    };
    if !self.seeds.read().iter().any(|(k, s)| answered(k, s)) {
      return;
    }
    self.seeds.write().retain(|key, seed| {
      let done = answered(key, seed);
      if done {
        log::debug!("Conversion {} now tracked by server status", key);
      }
      !done
    });
  }

  /// Current record for one job: the server's once it has reported the key
  /// after the trigger, the optimistic one until then.
  pub fn job(&self, key: &JobKey) -> Option<ConversionJob> {
    let snapshot = self.status.current();
    self.settle(&snapshot);
    if let Some(seed) = self.seeds.read().get(key) {
      return Some(seed.job.clone());
    }
    snapshot.and_then(|s| s.value.get(key.as_str()).cloned())
  }

  /// Server table with any still-unanswered optimistic records laid over it.
  pub fn jobs(&self) -> ConversionTable {
    let snapshot = self.status.current();
    self.settle(&snapshot);
    let mut table = snapshot.map(|s| (*s.value).clone()).unwrap_or_default();
    for (key, seed) in self.seeds.read().iter() {
      table.insert(key.as_str().to_string(), seed.job.clone());
    }
    table
  }

  /// Notified whenever a new status snapshot lands.
  pub fn subscribe(&self) -> watch::Receiver<Option<Snapshot<ConversionTable>>> {
    self.status.subscribe()
  }

  pub fn stop(&self) {
    self.status.stop();
  }
}
