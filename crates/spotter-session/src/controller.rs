use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use spotter_capture::CaptureQueue;
use spotter_vision::{MatchResult, Template};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::loop_worker::{search_loop, LoopContext};
use crate::state::{ControlReply, SessionState, SessionStatus};
use crate::{ActionDispatcher, SessionListener, TemplateMatcher};

/// Loop pacing and retry knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Delay between search iterations.
    pub search_interval: Duration,
    /// Capture retries per iteration before the loop gives up.
    pub submit_retry_limit: u32,
    /// Delay between capture retries.
    pub submit_retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            search_interval: Duration::from_millis(2000),
            submit_retry_limit: 3,
            submit_retry_delay: Duration::from_millis(500),
        }
    }
}

/// State shared between the controller, the loop task, and status queries.
pub(crate) struct Shared {
    state: watch::Sender<SessionState>,
    template: RwLock<Option<Arc<Template>>>,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
    search_attempts: AtomicU64,
    successful_finds: AtomicU64,
    last_result: RwLock<Option<MatchResult>>,
    activated_at: RwLock<Option<Instant>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: watch::Sender::new(SessionState::Stopped),
            template: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            search_attempts: AtomicU64::new(0),
            successful_finds: AtomicU64::new(0),
            last_result: RwLock::new(None),
            activated_at: RwLock::new(None),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn state_rx(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, next: SessionState) {
        let prev = *self.state.borrow();
        if prev == next {
            return;
        }
        debug!("session state {prev:?} -> {next:?}");
        self.state.send_replace(next);
        self.for_each_listener(|l| l.on_state_change(next));
    }

    /// Report an unrecoverable failure once and park the session in `Error`.
    pub(crate) fn report_fault(&self, message: &str) {
        error!("session fault: {message}");
        self.for_each_listener(|l| l.on_error(message));
        self.set_state(SessionState::Error);
    }

    pub(crate) fn current_template(&self) -> Option<Arc<Template>> {
        self.template.read().expect("template lock").clone()
    }

    pub(crate) fn record_attempt(&self) {
        self.search_attempts.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_find(&self, result: MatchResult) {
        self.successful_finds.fetch_add(1, Ordering::SeqCst);
        *self.last_result.write().expect("last result lock") = Some(result);
    }

    pub(crate) fn notify_result(&self, result: &MatchResult) {
        self.for_each_listener(|l| l.on_result(result));
    }

    /// Fan out to a snapshot of the listener list. One listener's panic is
    /// contained and logged; the remaining listeners are still notified.
    fn for_each_listener(&self, f: impl Fn(&dyn SessionListener)) {
        let snapshot: Vec<Arc<dyn SessionListener>> =
            self.listeners.read().expect("listener lock").clone();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                warn!("session listener panicked, skipping it for this event");
            }
        }
    }

    fn status(&self) -> SessionStatus {
        let state = self.state();
        let active_duration_ms = self
            .activated_at
            .read()
            .expect("activation lock")
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        SessionStatus {
            is_active: state.is_active(),
            is_paused: state.is_paused(),
            state,
            search_attempts: self.search_attempts.load(Ordering::SeqCst),
            successful_finds: self.successful_finds.load(Ordering::SeqCst),
            active_duration_ms,
            last_result: self.last_result.read().expect("last result lock").clone(),
        }
    }
}

struct RunHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns one search session: a state machine around a single long-lived loop
/// task. Construct once and share; all control operations take `&self`.
pub struct SessionController {
    shared: Arc<Shared>,
    queue: Arc<CaptureQueue>,
    matcher: Arc<dyn TemplateMatcher>,
    dispatcher: Arc<dyn ActionDispatcher>,
    config: SessionConfig,
    run: Mutex<Option<RunHandle>>,
}

impl SessionController {
    pub fn new(
        queue: Arc<CaptureQueue>,
        matcher: Arc<dyn TemplateMatcher>,
        dispatcher: Arc<dyn ActionDispatcher>,
        config: SessionConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            queue,
            matcher,
            dispatcher,
            config,
            run: Mutex::new(None),
        }
    }

    /// Replace the current template. The loop picks the new one up at its
    /// next iteration; an in-flight match keeps the reference it started with.
    pub fn set_template(&self, template: Template) {
        *self.shared.template.write().expect("template lock") = Some(Arc::new(template));
    }

    pub fn clear_template(&self) {
        *self.shared.template.write().expect("template lock") = None;
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.shared
            .listeners
            .write()
            .expect("listener lock")
            .push(listener);
    }

    /// Snapshot of the session, cheap enough for polling.
    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// Start searching. Requires a configured template and a reachable
    /// capture capability; a failed precondition parks the session in
    /// `Error` (exited only by `stop`).
    pub fn start(&self) -> ControlReply {
        let mut run = self.run.lock().expect("run lock");
        let state = self.shared.state();
        if state != SessionState::Stopped {
            return ControlReply::rejected(format!("cannot start while {state:?}"));
        }

        self.shared.set_state(SessionState::Starting);

        if self.shared.current_template().is_none() {
            self.shared.report_fault("no template configured");
            return ControlReply::rejected("no template configured");
        }
        if !self.queue.provider_available() {
            self.shared.report_fault("capture provider unavailable");
            return ControlReply::rejected("capture provider unavailable");
        }

        self.shared.search_attempts.store(0, Ordering::SeqCst);
        self.shared.successful_finds.store(0, Ordering::SeqCst);
        *self.shared.last_result.write().expect("last result lock") = None;

        let cancel = CancellationToken::new();
        let ctx = LoopContext {
            shared: self.shared.clone(),
            queue: self.queue.clone(),
            matcher: self.matcher.clone(),
            dispatcher: self.dispatcher.clone(),
            config: self.config.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(search_loop(ctx));
        *run = Some(RunHandle { cancel, handle });

        *self.shared.activated_at.write().expect("activation lock") = Some(Instant::now());
        self.shared.set_state(SessionState::Active);
        info!("session started");
        ControlReply::ok("session started")
    }

    /// Stop the session from any running (or errored) state. Cancels the
    /// loop promptly — mid-sleep and mid-wait included — and joins it.
    pub async fn stop(&self) -> ControlReply {
        let taken = self.run.lock().expect("run lock").take();
        if taken.is_none() && self.shared.state() == SessionState::Stopped {
            return ControlReply::rejected("session is not running");
        }

        self.shared.set_state(SessionState::Stopping);
        if let Some(RunHandle { cancel, handle }) = taken {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("search loop task failed to join: {e}");
            }
        }
        *self.shared.activated_at.write().expect("activation lock") = None;
        self.shared.set_state(SessionState::Stopped);
        info!("session stopped");
        ControlReply::ok("session stopped")
    }

    /// Suspend searching without tearing the session down.
    pub fn pause(&self) -> ControlReply {
        let _run = self.run.lock().expect("run lock");
        let state = self.shared.state();
        if state != SessionState::Active {
            return ControlReply::rejected(format!("cannot pause while {state:?}"));
        }
        self.shared.set_state(SessionState::Pausing);
        self.shared.set_state(SessionState::Paused);
        info!("session paused");
        ControlReply::ok("session paused")
    }

    pub fn resume(&self) -> ControlReply {
        let _run = self.run.lock().expect("run lock");
        let state = self.shared.state();
        if state != SessionState::Paused {
            return ControlReply::rejected(format!("cannot resume while {state:?}"));
        }
        self.shared.set_state(SessionState::Resuming);
        self.shared.set_state(SessionState::Active);
        info!("session resumed");
        ControlReply::ok("session resumed")
    }
}
