//! Session controller: drives the capture → match → act loop with
//! start/stop/pause/resume semantics and failure containment.

mod controller;
mod loop_worker;
mod state;

use image::RgbaImage;
use spotter_vision::{MatchConfig, MatchResult, Template};

pub use controller::{SessionConfig, SessionController};
pub use state::{ControlReply, SessionState, SessionStatus};

/// Seam over the match engine, so hosts (and tests) can substitute the
/// scoring implementation without touching the session machinery.
pub trait TemplateMatcher: Send + Sync + 'static {
    fn find(&self, screen: &RgbaImage, template: &Template) -> MatchResult;
}

/// Production matcher backed by the `spotter-vision` scan.
#[derive(Debug, Default)]
pub struct EngineMatcher {
    config: MatchConfig,
}

impl EngineMatcher {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }
}

impl TemplateMatcher for EngineMatcher {
    fn find(&self, screen: &RgbaImage, template: &Template) -> MatchResult {
        spotter_vision::find_match(screen, template, &self.config)
    }
}

/// The external synthetic-interaction capability. Called with the center
/// coordinates of an accepted match, exactly once per accepted match per
/// iteration; failures are logged by the session, never fatal to it.
pub trait ActionDispatcher: Send + Sync + 'static {
    fn dispatch(&self, x: i32, y: i32) -> anyhow::Result<()>;
}

/// Dispatcher that only logs the coordinates. Useful for demos and dry runs.
#[derive(Debug, Default)]
pub struct LogDispatcher;

impl ActionDispatcher for LogDispatcher {
    fn dispatch(&self, x: i32, y: i32) -> anyhow::Result<()> {
        tracing::info!("dispatch requested at ({x}, {y})");
        Ok(())
    }
}

/// Observer of session activity. All methods default to no-ops; implement
/// the ones of interest. A panicking listener is logged and skipped, it
/// cannot keep other listeners from being notified.
pub trait SessionListener: Send + Sync {
    fn on_state_change(&self, _state: SessionState) {}
    fn on_result(&self, _result: &MatchResult) {}
    fn on_error(&self, _message: &str) {}
}
