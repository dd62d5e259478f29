//! Core types and shared plumbing for the spindle streaming engine.
//!
//! This crate defines the foundational abstractions used across the workspace:
//! - Command and acknowledgement types
//! - The engine error taxonomy
//! - Layered configuration (TOML file, then environment)
//! - The engine event bus
//! - The alarm catalog and controller code descriptions

pub mod alarms;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod job;
pub mod status;

pub use alarms::{AlarmCatalog, AlarmLookup, describe_alarm, describe_error, parse_alarm_code_line};
pub use command::{Ack, AckResponse, Command, CommandId, CommandKind, RealtimeCommand};
pub use config::EngineConfig;
pub use error::{EngineError, Result, TransportError};
pub use event::{EngineEvent, EventMetadata};
pub use eventbus::{EventBus, EventBusReceiver, EventFilter, FilteredReceiver};
pub use job::{JobEndReason, JobInfo, JobProgress, JobState, LineOrigin};
pub use status::RawStatusReport;

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::command::{Ack, AckResponse, Command, CommandId, CommandKind, RealtimeCommand};
    pub use crate::config::EngineConfig;
    pub use crate::error::{EngineError, Result, TransportError};
    pub use crate::event::{EngineEvent, EventMetadata};
    pub use crate::eventbus::EventBus;
    pub use crate::job::{JobEndReason, JobInfo, JobProgress, JobState, LineOrigin};
}
