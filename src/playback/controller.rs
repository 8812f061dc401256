//! Playback session controller.
//!
//! Owns at most one session bound to one media element. Every request tears the
//! previous session down (synchronously, under the controller lock) before
//! anything new is attached, and every async continuation re-checks its
//! [`Token`] before touching shared state.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::backend::{AdaptiveEngine, AdaptiveSession, FaultClass, MediaElement, SessionEvent, StreamFault};
use super::error::PlaybackError;
use super::media::PlaybackRequest;
use super::state::{Input, PlaybackState};
use crate::api::redact_url;
use crate::sync::{StaleGuard, Token};

/// In-place recoveries allowed per fault class before the session is given up.
const MAX_RETRIES_PER_CLASS: u8 = 1;

/// Notifications for whoever owns the play/close affordance.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackNotice {
  Playing { media_ref: String },
  Recovering { media_ref: String, class: FaultClass },
  Failed { media_ref: String, reason: String },
  Ended { media_ref: String },
  Closed,
}

/// Result of an [`PlaybackController::open`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
  Playing,
  /// Host element not ready yet; kept as the single pending request.
  Queued,
  /// A later request or a close overtook this one while it was opening.
  Superseded,
}

enum Attachment {
  /// Adaptive session still being constructed.
  Pending,
  Direct,
  Adaptive {
    session: Box<dyn AdaptiveSession>,
    events: CancellationToken,
  },
}

struct Active {
  token: Token,
  request: PlaybackRequest,
  attachment: Attachment,
  network_retries: u8,
  media_retries: u8,
}

impl Active {
  fn new(token: Token, request: PlaybackRequest) -> Self {
    Self {
      token,
      request,
      attachment: Attachment::Pending,
      network_retries: 0,
      media_retries: 0,
    }
  }
}

struct Inner {
  state: PlaybackState,
  host: Option<Arc<dyn MediaElement>>,
  pending: Option<PlaybackRequest>,
  active: Option<Active>,
}

struct Core {
  origin: String,
  engine: Arc<dyn AdaptiveEngine>,
  guard: StaleGuard,
  inner: Mutex<Inner>,
  notices: async_channel::Sender<PlaybackNotice>,
}

/// Where an open stands once its synchronous half has run.
enum Begun {
  Done(Result<OpenOutcome, PlaybackError>),
  /// Element reserved; the adaptive session still has to be created.
  Adaptive {
    token: Token,
    host: Arc<dyn MediaElement>,
    url: String,
    request: PlaybackRequest,
  },
}

impl Core {
  fn transition(inner: &mut Inner, input: Input) {
    match inner.state.next(input) {
      Some(next) => {
        log::debug!("Playback {} --{:?}--> {}", inner.state, input, next);
        inner.state = next;
      }
      None => log::debug!("Playback ignoring {:?} in state {}", input, inner.state),
    }
  }

  fn notify(&self, notice: PlaybackNotice) {
    if self.notices.try_send(notice).is_err() {
      log::trace!("No playback notice listener");
    }
  }

  /// Detach and destroy whatever the active request holds.
  fn release(inner: &mut Inner) {
    let Some(active) = inner.active.take() else {
      return;
    };
    match active.attachment {
      Attachment::Pending => {}
      Attachment::Direct => {
        if let Some(host) = &inner.host {
          host.clear_source();
        }
      }
      Attachment::Adaptive {
        mut session,
        events,
      } => {
        events.cancel();
        session.destroy();
      }
    }
    log::info!("Released {} session for {}", active.request.kind, active.request.media_ref);
  }

  /// Supersede outstanding work and bring the controller back to `Idle`.
  fn teardown(&self, inner: &mut Inner) {
    self.guard.supersede();
    if inner.state == PlaybackState::Idle {
      return;
    }
    Self::transition(inner, Input::Close);
    Self::release(inner);
    Self::transition(inner, Input::Destroyed);
  }

  /// Destroy the session for good and report the failure once.
  fn fail(&self, inner: &mut Inner, reason: String) {
    self.guard.supersede();
    let media_ref = inner
      .active
      .as_ref()
      .map(|a| a.request.media_ref.clone())
      .unwrap_or_default();
    Self::release(inner);
    Self::transition(inner, Input::UnrecoverableFault);
    log::error!("Playback of {} failed: {}", media_ref, reason);
    self.notify(PlaybackNotice::Failed { media_ref, reason });
  }

  fn handle_event(&self, token: Token, event: SessionEvent) {
    let mut inner = self.inner.lock();
    if !self.guard.is_current(token) {
      log::debug!("Dropping session event from superseded request: {:?}", event);
      return;
    }

    let media_ref = inner
      .active
      .as_ref()
      .map(|a| a.request.media_ref.clone())
      .unwrap_or_default();

    match event {
      SessionEvent::Fault(fault) => {
        let recovered = match inner.active.as_mut() {
          Some(active) => Self::try_recover(active, &fault),
          None => return,
        };
        if recovered {
          Self::transition(&mut inner, Input::RecoverableFault);
          self.notify(PlaybackNotice::Recovering {
            media_ref,
            class: fault.class,
          });
        } else {
          self.fail(&mut inner, PlaybackError::Unrecoverable(fault).to_string());
        }
      }
      SessionEvent::Resumed => {
        let was_recovering = inner.state == PlaybackState::Recovering;
        if let Some(active) = inner.active.as_mut() {
          active.network_retries = 0;
          active.media_retries = 0;
        }
        Self::transition(&mut inner, Input::Resumed);
        if was_recovering {
          log::info!("Playback of {} recovered", media_ref);
          self.notify(PlaybackNotice::Playing { media_ref });
        }
      }
      SessionEvent::Ended => {
        log::info!("Stream ended: {}", media_ref);
        self.teardown(&mut inner);
        self.notify(PlaybackNotice::Ended { media_ref });
      }
    }
  }

  /// Ask the session to recover in place. `false` means the fault is terminal.
  fn try_recover(active: &mut Active, fault: &StreamFault) -> bool {
    let Attachment::Adaptive { session, .. } = &mut active.attachment else {
      return false;
    };
    let retries = match fault.class {
      FaultClass::Network => &mut active.network_retries,
      FaultClass::Media => &mut active.media_retries,
      FaultClass::Other => return false,
    };
    if *retries >= MAX_RETRIES_PER_CLASS {
      log::warn!(
        "{:?} fault repeated on {} before recovery, giving up",
        fault.class,
        active.request.media_ref
      );
      return false;
    }
    *retries += 1;

    match fault.class {
      FaultClass::Network => {
        log::warn!("{} - resuming load of {}", fault, active.request.media_ref);
        session.start_load();
      }
      FaultClass::Media => {
        log::warn!("{} - recovering decoder for {}", fault, active.request.media_ref);
        session.recover_media_error();
      }
      FaultClass::Other => {}
    }
    true
  }

  /// Tear down what is playing and start `request`: direct sources are
  /// assigned here, adaptive ones get the element reserved under a new token.
  fn begin_open(&self, inner: &mut Inner, host: Arc<dyn MediaElement>, request: PlaybackRequest) -> Begun {
    self.teardown(inner);
    Self::transition(inner, Input::Open);
    let token = self.guard.begin();
    let url = request.source_url(&self.origin);
    log::info!("Opening {} as {} from {}", request.media_ref, request.kind, redact_url(&url));
    inner.active = Some(Active::new(token, request.clone()));

    if request.kind.is_adaptive() {
      return Begun::Adaptive {
        token,
        host,
        url,
        request,
      };
    }

    if let Err(e) = host.assign_source(&url) {
      self.fail(inner, e.to_string());
      return Begun::Done(Err(e));
    }
    if let Some(active) = inner.active.as_mut() {
      active.attachment = Attachment::Direct;
    }
    Self::transition(inner, Input::SourceAssigned);
    self.notify(PlaybackNotice::Playing {
      media_ref: request.media_ref,
    });
    Begun::Done(Ok(OpenOutcome::Playing))
  }

  /// Create and attach the adaptive session, unless the open was superseded meanwhile.
  async fn finish_open(self: &Arc<Self>, begun: Begun) -> Result<OpenOutcome, PlaybackError> {
    let (token, host, url, request) = match begun {
      Begun::Done(outcome) => return outcome,
      Begun::Adaptive {
        token,
        host,
        url,
        request,
      } => (token, host, url, request),
    };

    let created = self.engine.create(&url).await;

    let mut inner = self.inner.lock();
    if !self.guard.is_current(token) {
      if let Ok(mut session) = created {
        log::info!("Discarding session for superseded request {}", request.media_ref);
        session.destroy();
      }
      return Ok(OpenOutcome::Superseded);
    }

    let mut session = match created {
      Ok(session) => session,
      Err(e) => {
        self.fail(&mut inner, e.to_string());
        return Err(e);
      }
    };

    Self::transition(&mut inner, Input::SessionCreated);
    if let Err(e) = session.attach(&*host) {
      session.destroy();
      self.fail(&mut inner, e.to_string());
      return Err(e);
    }

    let events = spawn_event_forwarder(self.clone(), token, session.events());
    match inner.active.as_mut() {
      Some(active) => active.attachment = Attachment::Adaptive { session, events },
      None => {
        events.cancel();
        session.destroy();
        return Ok(OpenOutcome::Superseded);
      }
    }
    Self::transition(&mut inner, Input::Attached);
    self.notify(PlaybackNotice::Playing {
      media_ref: request.media_ref,
    });
    Ok(OpenOutcome::Playing)
  }
}

/// Forward a session's events into the controller until cancelled.
fn spawn_event_forwarder(
  core: Arc<Core>,
  token: Token,
  events: async_channel::Receiver<SessionEvent>,
) -> CancellationToken {
  let cancel = CancellationToken::new();
  let stop = cancel.clone();
  tokio::spawn(async move {
    loop {
      tokio::select! {
        _ = stop.cancelled() => break,
        event = events.recv() => match event {
          Ok(event) => core.handle_event(token, event),
          Err(_) => break,
        },
      }
    }
  });
  cancel
}

/// Owns the playback session of one host element.
pub struct PlaybackController {
  core: Arc<Core>,
}

impl PlaybackController {
  /// Create a controller. Relative media references resolve against `origin`.
  pub fn new(
    origin: impl Into<String>,
    engine: Arc<dyn AdaptiveEngine>,
  ) -> (Self, async_channel::Receiver<PlaybackNotice>) {
    let (notices, notice_rx) = async_channel::unbounded();
    let core = Arc::new(Core {
      origin: origin.into(),
      engine,
      guard: StaleGuard::new(),
      inner: Mutex::new(Inner {
        state: PlaybackState::Idle,
        host: None,
        pending: None,
        active: None,
      }),
      notices,
    });
    (Self { core }, notice_rx)
  }

  pub fn state(&self) -> PlaybackState {
    self.core.inner.lock().state
  }

  pub fn current_request(&self) -> Option<PlaybackRequest> {
    self.core.inner.lock().active.as_ref().map(|a| a.request.clone())
  }

  pub fn pending_request(&self) -> Option<PlaybackRequest> {
    self.core.inner.lock().pending.clone()
  }

  /// Token of the request currently owning the element.
  pub fn session_token(&self) -> Option<Token> {
    self.core.inner.lock().active.as_ref().map(|a| a.token)
  }

  pub fn is_host_ready(&self) -> bool {
    self.core.inner.lock().host.is_some()
  }

  /// The hosting element exists. Accepted once per mount; opens the pending request.
  pub async fn host_ready(
    &self,
    element: Arc<dyn MediaElement>,
  ) -> Result<Option<OpenOutcome>, PlaybackError> {
    let begun = {
      let mut inner = self.core.inner.lock();
      if inner.host.is_some() {
        log::warn!("Playback host reported ready twice for one mount, ignoring");
        return Ok(None);
      }
      inner.host = Some(element.clone());
      let Some(request) = inner.pending.take() else {
        return Ok(None);
      };
      // Started under the same lock, so any later open() supersedes it.
      log::info!("Playback host ready, opening queued {}", request.media_ref);
      self.core.begin_open(&mut inner, element, request)
    };
    self.core.finish_open(begun).await.map(Some)
  }

  /// The hosting element is going away: close and forget it.
  pub fn host_unmounted(&self) {
    let mut inner = self.core.inner.lock();
    inner.pending = None;
    self.core.teardown(&mut inner);
    inner.host = None;
    log::debug!("Playback host unmounted");
  }

  /// Play `request`, replacing whatever is playing.
  pub async fn open(&self, request: PlaybackRequest) -> Result<OpenOutcome, PlaybackError> {
    let begun = {
      let mut inner = self.core.inner.lock();
      let Some(host) = inner.host.clone() else {
        log::info!("Playback host not ready, queueing {}", request.media_ref);
        if let Some(old) = inner.pending.replace(request) {
          log::debug!("Dropped earlier queued request {}", old.media_ref);
        }
        return Ok(OpenOutcome::Queued);
      };
      self.core.begin_open(&mut inner, host, request)
    };
    self.core.finish_open(begun).await
  }

  /// Stop playback. `on_closed` runs once if anything was open; closing an idle
  /// controller does nothing.
  pub fn close<F: FnOnce()>(&self, on_closed: F) -> bool {
    {
      let mut inner = self.core.inner.lock();
      inner.pending = None;
      if inner.state == PlaybackState::Idle {
        log::debug!("close() on idle controller, nothing to do");
        return false;
      }
      self.core.teardown(&mut inner);
    }
    log::info!("Playback closed");
    self.core.notify(PlaybackNotice::Closed);
    on_closed();
    true
  }

  /// Feed a session event tagged with the token of the request that produced it.
  pub fn handle_event(&self, token: Token, event: SessionEvent) {
    self.core.handle_event(token, event);
  }
}

impl Drop for PlaybackController {
  fn drop(&mut self) {
    let mut inner = self.core.inner.lock();
    inner.pending = None;
    self.core.teardown(&mut inner);
  }
}
