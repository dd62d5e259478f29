//! Engine error taxonomy.

use serde::{Deserialize, Serialize};

/// Result type used across the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Serial link failures reported by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is not open")]
    NotOpen,

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Failed to open port: {0}")]
    OpenFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Connection closed: {0}")]
    Closed(String),
}

/// Engine-level errors.
///
/// Transport and controller errors are fatal to the running job and are
/// surfaced to observers; protocol and plugin errors are contained where they
/// occur and only reach this type when a caller asks for them explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum EngineError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Controller error {code}: {description}")]
    Controller { code: u16, description: String },

    #[error("Alarm {code}: {description}")]
    AlarmRaised { code: u16, description: String },

    #[error("Controller reset while commands were in flight")]
    ControllerReset,

    #[error("Plugin handler error ({plugin}): {message}")]
    PluginHandler { plugin: String, message: String },

    #[error("A job is already running")]
    AlreadyRunning,

    #[error("No active job")]
    NoActiveJob,

    #[error("Invalid job state transition: {0}")]
    InvalidTransition(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl EngineError {
    /// Build a controller error with its catalogued description.
    pub fn controller(code: u16) -> Self {
        EngineError::Controller {
            code,
            description: crate::alarms::describe_error(code).to_string(),
        }
    }

    /// Check if this error should fail the running job.
    pub fn is_fatal_to_job(&self) -> bool {
        matches!(
            self,
            EngineError::Transport(_)
                | EngineError::Controller { .. }
                | EngineError::ControllerReset
                | EngineError::PluginHandler { .. }
        )
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}
