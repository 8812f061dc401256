//! Fixed-interval poller that mirrors one piece of server state into a local cache.
//!
//! A poller is bound to a single [`PollTarget`] for its whole life. Fetches are
//! never pipelined: a tick that comes due while a fetch is outstanding is
//! skipped. Every fetch carries the [`StaleGuard`] token it was issued under and
//! its result is dropped if the poller has been stopped since.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::guard::{StaleGuard, Token};
use crate::api::ApiError;

/// Which piece of remote state a poller tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PollTarget {
  Tasks,
  Recordings { task_id: String },
  ActiveSet,
  Logs { task_id: String },
  ConversionStatus,
}

impl fmt::Display for PollTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PollTarget::Tasks => f.write_str("tasks"),
      PollTarget::Recordings { task_id } => write!(f, "recordings[{}]", task_id),
      PollTarget::ActiveSet => f.write_str("active-set"),
      PollTarget::Logs { task_id } => write!(f, "logs[{}]", task_id),
      PollTarget::ConversionStatus => f.write_str("conversion-status"),
    }
  }
}

/// Future returned by a poll fetch function.
pub type FetchFuture<T> = BoxFuture<'static, Result<T, ApiError>>;

/// Shared fetch function, for owners that restart pollers on retarget.
pub type FetchFn<T> = Arc<dyn Fn(&PollTarget) -> FetchFuture<T> + Send + Sync>;

/// Last successfully fetched value for a target.
#[derive(Debug)]
pub struct Snapshot<T> {
  pub value: Arc<T>,
  /// Guard generation the fetch was issued under.
  pub generation: u64,
  /// Per-poller issue order of the fetch, starting at 1.
  pub sequence: u64,
  pub fetched_at: Instant,
}

impl<T> Clone for Snapshot<T> {
  fn clone(&self) -> Self {
    Self {
      value: self.value.clone(),
      generation: self.generation,
      sequence: self.sequence,
      fetched_at: self.fetched_at,
    }
  }
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
  pub issued: u64,
  pub skipped: u64,
  pub applied: u64,
  pub failed: u64,
  pub stale: u64,
  pub consecutive_failures: u32,
}

struct Shared<T> {
  target: PollTarget,
  guard: StaleGuard,
  cache: watch::Sender<Option<Snapshot<T>>>,
  in_flight: AtomicBool,
  sequence: AtomicU64,
  /// Held while a result is checked and applied, and while stopping.
  stats: Mutex<PollStats>,
  cancel: CancellationToken,
}

impl<T: Send + Sync + 'static> Shared<T> {
  fn issue<F>(self: &Arc<Self>, fetch: &F)
  where
    F: Fn(&PollTarget) -> FetchFuture<T>,
  {
    if self.in_flight.swap(true, Ordering::AcqRel) {
      self.stats.lock().skipped += 1;
      log::trace!("Poll {}: previous fetch outstanding, skipping tick", self.target);
      return;
    }

    let token = self.guard.begin();
    let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
    self.stats.lock().issued += 1;

    let request = fetch(&self.target);
    let shared = self.clone();
    tokio::spawn(async move {
      // The fetch runs in its own task so a panic surfaces as a JoinError.
      match tokio::spawn(request).await {
        Ok(result) => shared.complete(token, sequence, result),
        Err(e) => shared.abandon(token, sequence, e),
      }
      shared.in_flight.store(false, Ordering::Release);
    });
  }

  /// Count a fetch that panicked or was cancelled as a failure.
  fn abandon(&self, token: Token, sequence: u64, error: JoinError) {
    let mut stats = self.stats.lock();
    if !self.guard.is_current(token) {
      stats.stale += 1;
      return;
    }
    stats.failed += 1;
    stats.consecutive_failures += 1;
    log::error!(
      "Poll {}: fetch #{} aborted ({} failures in a row): {}",
      self.target,
      sequence,
      stats.consecutive_failures,
      error
    );
  }

  fn complete(&self, token: Token, sequence: u64, result: Result<T, ApiError>) {
    let mut stats = self.stats.lock();

    if !self.guard.is_current(token) {
      stats.stale += 1;
      log::debug!(
        "Poll {}: dropping stale result #{} (generation {})",
        self.target,
        sequence,
        token.generation()
      );
      return;
    }

    match result {
      Ok(value) => {
        stats.applied += 1;
        stats.consecutive_failures = 0;
        self.cache.send_replace(Some(Snapshot {
          value: Arc::new(value),
          generation: token.generation(),
          sequence,
          fetched_at: Instant::now(),
        }));
      }
      Err(e) => {
        stats.failed += 1;
        stats.consecutive_failures += 1;
        log::warn!(
          "Poll {} failed ({} in a row), keeping previous snapshot: {}",
          self.target,
          stats.consecutive_failures,
          e
        );
      }
    }
  }
}

/// Handle to a running poller. Dropping it stops the poller.
pub struct PollHandle<T> {
  shared: Arc<Shared<T>>,
  _task: JoinHandle<()>,
}

impl<T: Send + Sync + 'static> PollHandle<T> {
  /// Start polling `target` every `interval`, beginning immediately.
  ///
  /// Must be called from within a tokio runtime.
  pub fn start<F>(target: PollTarget, interval: Duration, fetch: F) -> Self
  where
    F: Fn(&PollTarget) -> FetchFuture<T> + Send + Sync + 'static,
  {
    let (cache, _) = watch::channel(None);
    let shared = Arc::new(Shared {
      target,
      guard: StaleGuard::new(),
      cache,
      in_flight: AtomicBool::new(false),
      sequence: AtomicU64::new(0),
      stats: Mutex::new(PollStats::default()),
      cancel: CancellationToken::new(),
    });

    log::debug!("Poll {}: starting, every {:?}", shared.target, interval);

    let loop_shared = shared.clone();
    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
        tokio::select! {
          _ = loop_shared.cancel.cancelled() => break,
          _ = ticker.tick() => loop_shared.issue(&fetch),
        }
      }
      log::debug!("Poll {}: loop stopped", loop_shared.target);
    });

    Self {
      shared,
      _task: task,
    }
  }

  /// Latest applied snapshot, if any fetch has succeeded yet.
  pub fn current(&self) -> Option<Snapshot<T>> {
    self.shared.cache.borrow().clone()
  }

  /// Receiver notified each time a snapshot is applied.
  pub fn subscribe(&self) -> watch::Receiver<Option<Snapshot<T>>> {
    self.shared.cache.subscribe()
  }

  pub fn target(&self) -> &PollTarget {
    &self.shared.target
  }

  pub fn stats(&self) -> PollStats {
    *self.shared.stats.lock()
  }

  /// Sequence number of the most recently issued fetch (0 before the first).
  pub fn last_issued_sequence(&self) -> u64 {
    self.shared.sequence.load(Ordering::Acquire)
  }
}

impl<T> PollHandle<T> {
  pub fn is_running(&self) -> bool {
    !self.shared.cancel.is_cancelled()
  }

  /// Stop polling. Results of fetches still in flight are discarded.
  pub fn stop(&self) {
    if self.shared.cancel.is_cancelled() {
      return;
    }
    {
      let _stats = self.shared.stats.lock();
      self.shared.guard.supersede();
    }
    self.shared.cancel.cancel();
    log::debug!("Poll {}: stopped", self.shared.target);
  }
}

impl<T> Drop for PollHandle<T> {
  fn drop(&mut self) {
    self.stop();
  }
}

/// Owns at most one poller and replaces it whenever the target changes.
pub struct TargetedPoller<T> {
  interval: Duration,
  fetch: FetchFn<T>,
  handle: Option<PollHandle<T>>,
}

impl<T: Send + Sync + 'static> TargetedPoller<T> {
  pub fn new(interval: Duration, fetch: FetchFn<T>) -> Self {
    Self {
      interval,
      fetch,
      handle: None,
    }
  }

  /// Point the poller at `target`. The old poller is torn down first; switching
  /// to the target already being polled is a no-op.
  pub fn switch(&mut self, target: PollTarget) {
    if let Some(handle) = &self.handle {
      if handle.target() == &target && handle.is_running() {
        return;
      }
    }
    self.clear();

    let fetch = self.fetch.clone();
    self.handle = Some(PollHandle::start(target, self.interval, move |t| fetch(t)));
  }

  /// Stop polling altogether.
  pub fn clear(&mut self) {
    if let Some(handle) = self.handle.take() {
      handle.stop();
    }
  }

  pub fn target(&self) -> Option<&PollTarget> {
    self.handle.as_ref().map(|h| h.target())
  }

  pub fn current(&self) -> Option<Snapshot<T>> {
    self.handle.as_ref().and_then(|h| h.current())
  }

  pub fn handle(&self) -> Option<&PollHandle<T>> {
    self.handle.as_ref()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures_util::FutureExt;
  use std::sync::atomic::AtomicUsize;
  use tokio::sync::Semaphore;

  const TICK: Duration = Duration::from_millis(100);

  fn counting_fetch(calls: Arc<AtomicUsize>) -> impl Fn(&PollTarget) -> FetchFuture<usize> {
    move |_: &PollTarget| {
      let calls = calls.clone();
      async move { Ok(calls.fetch_add(1, Ordering::SeqCst) + 1) }.boxed()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetches_immediately_then_on_interval() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handle = PollHandle::start(PollTarget::Tasks, TICK, counting_fetch(calls.clone()));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let first = handle.current().expect("first snapshot");
    assert_eq!(*first.value, 1);
    assert_eq!(first.sequence, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let latest = handle.current().unwrap();
    assert_eq!(*latest.value, 4);
    assert_eq!(latest.sequence, 4);
    assert_eq!(handle.last_issued_sequence(), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_slow_fetch_skips_ticks_without_overlap() {
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let (a, m) = (active.clone(), max_active.clone());

    let handle = PollHandle::start(PollTarget::ActiveSet, TICK, move |_| {
      let (a, m) = (a.clone(), m.clone());
      async move {
        let now = a.fetch_add(1, Ordering::SeqCst) + 1;
        m.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(250)).await;
        a.fetch_sub(1, Ordering::SeqCst);
        Ok(Vec::<String>::new())
      }
      .boxed()
    });

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    let stats = handle.stats();
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    assert!(stats.skipped > 0);
    assert!(stats.issued <= 4, "issued {} fetches", stats.issued);
  }

  #[tokio::test(start_paused = true)]
  async fn test_result_after_stop_is_discarded() {
    let gate = Arc::new(Semaphore::new(0));
    let g = gate.clone();
    let handle = PollHandle::start(PollTarget::Logs { task_id: "T".into() }, TICK, move |_| {
      let g = g.clone();
      async move {
        let _permit = g.acquire().await.expect("gate closed");
        Ok(vec!["late".to_string()])
      }
      .boxed()
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.stats().issued, 1);

    handle.stop();
    gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(handle.current().is_none());
    assert_eq!(handle.stats().stale, 1);
    assert!(!handle.is_running());
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_keeps_previous_snapshot() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let handle = PollHandle::start(PollTarget::ConversionStatus, TICK, move |_| {
      let n = c.fetch_add(1, Ordering::SeqCst);
      async move {
        if n == 0 {
          Ok("good".to_string())
        } else {
          Err(ApiError::MissingField("status"))
        }
      }
      .boxed()
    });

    tokio::time::sleep(Duration::from_millis(350)).await;
    let stats = handle.stats();
    assert_eq!(stats.applied, 1);
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.consecutive_failures, 3);
    assert_eq!(handle.current().unwrap().value.as_str(), "good");
    assert!(handle.is_running());
  }

  #[tokio::test(start_paused = true)]
  async fn test_panicking_fetch_does_not_stall_poller() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let handle = PollHandle::start(PollTarget::Recordings { task_id: "T".into() }, TICK, move |_| {
      let n = c.fetch_add(1, Ordering::SeqCst);
      async move {
        if n == 0 {
          panic!("fetch blew up");
        }
        Ok(n)
      }
      .boxed()
    });

    tokio::time::sleep(Duration::from_millis(350)).await;
    let stats = handle.stats();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.applied, 3);
    assert_eq!(stats.skipped, 0);
    assert_eq!(stats.consecutive_failures, 0);
    assert_eq!(*handle.current().unwrap().value, 3);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_next_fetch_sees_previous_result_applied() {
    type Cache = Option<watch::Receiver<Option<Snapshot<usize>>>>;
    let cache: Arc<Mutex<Cache>> = Arc::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let behind = Arc::new(AtomicUsize::new(0));
    let (c, k, b) = (calls.clone(), cache.clone(), behind.clone());

    let handle = PollHandle::start(PollTarget::Tasks, Duration::from_millis(1), move |_| {
      let n = c.fetch_add(1, Ordering::SeqCst) + 1;
      if let Some(rx) = k.lock().as_ref() {
        let applied = rx.borrow().as_ref().map_or(0, |s| *s.value);
        if n > 1 && applied != n - 1 {
          b.fetch_add(1, Ordering::SeqCst);
        }
      }
      async move { Ok(n) }.boxed()
    });
    *cache.lock() = Some(handle.subscribe());

    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.stop();
    assert!(calls.load(Ordering::SeqCst) > 5);
    assert_eq!(behind.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_switch_never_leaks_old_target_results() {
    let gate = Arc::new(Semaphore::new(0));
    let g = gate.clone();
    let fetch: FetchFn<String> = Arc::new(move |target: &PollTarget| {
      let g = g.clone();
      let target = target.clone();
      async move {
        if let PollTarget::Recordings { task_id } = &target {
          if task_id == "a" {
            let _permit = g.acquire().await.expect("gate closed");
          }
        }
        Ok(target.to_string())
      }
      .boxed()
    });

    let mut poller = TargetedPoller::new(TICK, fetch);
    poller.switch(PollTarget::Recordings { task_id: "a".into() });
    tokio::time::sleep(Duration::from_millis(10)).await;

    poller.switch(PollTarget::Recordings { task_id: "b".into() });
    gate.add_permits(10);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
      poller.target(),
      Some(&PollTarget::Recordings { task_id: "b".into() })
    );
    assert_eq!(poller.current().unwrap().value.as_str(), "recordings[b]");

    poller.clear();
    assert!(poller.current().is_none());
  }
}
