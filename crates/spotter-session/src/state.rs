use serde::{Deserialize, Serialize};
use spotter_vision::MatchResult;

/// Session state machine. Mutated only by the controller; observed by
/// listeners and status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Stopped,
    Starting,
    Active,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    /// Terminal until an explicit `stop`; the engine does not auto-recover.
    Error,
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, SessionState::Pausing | SessionState::Paused)
    }
}

/// Read-only snapshot of a session, derived on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub is_active: bool,
    pub is_paused: bool,
    pub state: SessionState,
    pub search_attempts: u64,
    pub successful_finds: u64,
    pub active_duration_ms: u64,
    pub last_result: Option<MatchResult>,
}

/// Outcome of a control command. Wrong-state commands are rejections
/// (`success == false`), not errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlReply {
    pub success: bool,
    pub message: String,
}

impl ControlReply {
    pub(crate) fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub(crate) fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&SessionState::Stopped).unwrap(),
            "\"stopped\""
        );
        assert_eq!(
            serde_json::to_string(&SessionState::Error).unwrap(),
            "\"error\""
        );
    }

    #[test]
    fn test_paused_class_covers_transition_state() {
        assert!(SessionState::Pausing.is_paused());
        assert!(SessionState::Paused.is_paused());
        assert!(!SessionState::Active.is_paused());
        assert!(SessionState::Active.is_active());
    }
}
