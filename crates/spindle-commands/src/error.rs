//! Error types for the session and the streaming queue.

use spindle_core::{EngineError, JobState, TransportError};

/// Protocol session errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Controller reset while the command was in flight")]
    ControllerReset,

    #[error("Command abandoned: {0}")]
    Abandoned(String),

    #[error("Session closed")]
    Closed,

    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

impl From<SessionError> for EngineError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Transport(e) => EngineError::Transport(e),
            SessionError::ControllerReset => EngineError::ControllerReset,
            SessionError::Abandoned(reason) => EngineError::Protocol(reason),
            SessionError::Closed => {
                EngineError::Transport(TransportError::Closed("session closed".to_string()))
            }
            SessionError::Timeout(what) => EngineError::Timeout(what),
        }
    }
}

/// Streaming queue errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueueError {
    #[error("A job is already running")]
    AlreadyRunning,

    #[error("No active job")]
    NoActiveJob,

    #[error("Cannot {action} a job that is {state}")]
    InvalidTransition { action: &'static str, state: JobState },

    #[error("Line needs {cost} bytes but the controller buffer holds {capacity}")]
    LineTooLong { cost: usize, capacity: usize },

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<QueueError> for EngineError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::AlreadyRunning => EngineError::AlreadyRunning,
            QueueError::NoActiveJob => EngineError::NoActiveJob,
            QueueError::InvalidTransition { .. } => EngineError::InvalidTransition(err.to_string()),
            QueueError::LineTooLong { .. } => EngineError::Protocol(err.to_string()),
            QueueError::Session(e) => e.into(),
        }
    }
}
