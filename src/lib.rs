//! spotter — a coordinate search engine for screen automation.
//!
//! The engine periodically captures the screen, scans the capture for a
//! stored template image, and hands the best match's center coordinates to
//! an action dispatcher ("find this icon, then click it"). Three components
//! cooperate: a paced, bounded capture queue; a stateless match engine; and
//! a session state machine driving capture → match → act on a timer.

mod engine;

pub use engine::{Engine, EngineConfig};

pub use spotter_capture::{
    CaptureError, CaptureProvider, CaptureQueue, CaptureQueueConfig, CaptureTicket, ScreenProvider,
};
pub use spotter_session::{
    ActionDispatcher, ControlReply, EngineMatcher, LogDispatcher, SessionConfig,
    SessionController, SessionListener, SessionState, SessionStatus, TemplateMatcher,
};
pub use spotter_vision::{
    codec, find_all_matches, find_match, MatchConfig, MatchResult, Template, TemplateError,
};
