//! Engine event types.
//!
//! Every component reports through these events: the protocol session
//! publishes one event per classified controller line, the streaming queue
//! publishes job lifecycle and progress, the watchdog publishes its
//! transitions, and plugins publish client-bound messages.

use serde::{Deserialize, Serialize};

use crate::command::{AckResponse, CommandId};
use crate::job::{JobEndReason, JobProgress, JobState, LineOrigin};
use crate::status::RawStatusReport;

/// Unified engine event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    // ========== Session Events ==========
    /// An in-flight command was acknowledged
    Acknowledged {
        command_id: CommandId,
        text: String,
        response: AckResponse,
    },

    /// A status report arrived
    StatusReport { report: RawStatusReport },

    /// The controller raised an alarm
    AlarmRaised { code: u16, description: String },

    /// Feedback, settings, banners and other informational lines
    SystemMessage { message: String },

    /// A line that matched no known pattern
    Unmatched { line: String },

    /// A line that could not be processed (e.g. an ack with nothing in flight)
    ProtocolError { line: String, reason: String },

    /// The controller printed its welcome banner
    ControllerReset { banner: String, dropped: usize },

    /// The transport reported the link as closed
    ConnectionClosed { reason: String },

    // ========== Job Events ==========
    /// Job state transition
    JobStateChanged {
        filename: String,
        from: JobState,
        to: JobState,
    },

    /// A line was written to the controller
    LineSent {
        #[serde(skip_serializing_if = "Option::is_none")]
        line_number: Option<usize>,
        text: String,
        origin: LineOrigin,
    },

    /// A program line was not transmitted
    LineSkipped { line_number: usize, rendered: String },

    /// Job progress counters changed
    JobProgress { progress: JobProgress },

    /// A job reached its terminal state
    JobFinished {
        filename: String,
        reason: JobEndReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // ========== Watchdog Events ==========
    /// The jog watchdog was armed
    WatchdogArmed { command_id: CommandId, timeout_ms: u64 },

    /// The jog watchdog was disarmed
    WatchdogCleared { command_id: CommandId },

    /// The jog watchdog expired and cancelled the jog
    WatchdogTimeout { command_id: CommandId, reason: String },

    // ========== Plugin Events ==========
    /// A plugin emitted a message for connected clients
    PluginMessage {
        plugin_id: String,
        event: String,
        payload: serde_json::Value,
    },
}

impl EngineEvent {
    /// Get the event type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Acknowledged { .. } => "Acknowledged",
            Self::StatusReport { .. } => "StatusReport",
            Self::AlarmRaised { .. } => "AlarmRaised",
            Self::SystemMessage { .. } => "SystemMessage",
            Self::Unmatched { .. } => "Unmatched",
            Self::ProtocolError { .. } => "ProtocolError",
            Self::ControllerReset { .. } => "ControllerReset",
            Self::ConnectionClosed { .. } => "ConnectionClosed",
            Self::JobStateChanged { .. } => "JobStateChanged",
            Self::LineSent { .. } => "LineSent",
            Self::LineSkipped { .. } => "LineSkipped",
            Self::JobProgress { .. } => "JobProgress",
            Self::JobFinished { .. } => "JobFinished",
            Self::WatchdogArmed { .. } => "WatchdogArmed",
            Self::WatchdogCleared { .. } => "WatchdogCleared",
            Self::WatchdogTimeout { .. } => "WatchdogTimeout",
            Self::PluginMessage { .. } => "PluginMessage",
        }
    }

    /// Check if this event came from the protocol session.
    pub fn is_session_event(&self) -> bool {
        matches!(
            self,
            Self::Acknowledged { .. }
                | Self::StatusReport { .. }
                | Self::AlarmRaised { .. }
                | Self::SystemMessage { .. }
                | Self::Unmatched { .. }
                | Self::ProtocolError { .. }
                | Self::ControllerReset { .. }
                | Self::ConnectionClosed { .. }
        )
    }

    /// Check if this is a job event.
    pub fn is_job_event(&self) -> bool {
        matches!(
            self,
            Self::JobStateChanged { .. }
                | Self::LineSent { .. }
                | Self::LineSkipped { .. }
                | Self::JobProgress { .. }
                | Self::JobFinished { .. }
        )
    }

    /// Check if this is a watchdog event.
    pub fn is_watchdog_event(&self) -> bool {
        matches!(
            self,
            Self::WatchdogArmed { .. } | Self::WatchdogCleared { .. } | Self::WatchdogTimeout { .. }
        )
    }
}

/// Event metadata attached on publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event ID
    pub event_id: String,
    /// Event source (component that published)
    pub source: String,
    /// Event timestamp (milliseconds)
    pub timestamp: i64,
}

impl EventMetadata {
    /// Create new event metadata.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
