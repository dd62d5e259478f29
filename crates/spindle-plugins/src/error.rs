//! Plugin error types.

use spindle_commands::QueueError;
use spindle_core::EngineError;
use thiserror::Error;

/// Result type for plugin host operations.
pub type Result<T> = std::result::Result<T, PluginError>;

/// Plugin host errors.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("Plugin {plugin} failed to load: {message}")]
    LoadFailed { plugin: String, message: String },

    #[error("Plugin {0} is unloaded")]
    Unloaded(String),

    #[error("Tool menu entry not found: {0}")]
    ToolMenuNotFound(String),

    #[error("Plugin {plugin} handler failed: {source}")]
    Handler {
        plugin: String,
        #[source]
        source: HandlerError,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Error returned by a plugin handler.
///
/// Non-fatal errors are logged and the stream carries on as if the handler
/// changed nothing. A fatal error fails the running job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub fatal: bool,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    /// An error that aborts the running job.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }

    /// Convert into the engine error carried by a failed job.
    pub fn into_engine_error(self, plugin: &str) -> EngineError {
        EngineError::PluginHandler {
            plugin: plugin.to_string(),
            message: self.message,
        }
    }
}

impl From<PluginError> for HandlerError {
    fn from(err: PluginError) -> Self {
        HandlerError::new(err.to_string())
    }
}
