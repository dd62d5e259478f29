//! Telemetry for the spindle streaming engine.
//!
//! Provides:
//! - Normalization of controller status reports into canonical snapshots
//! - Shallow state diffs with explicit removal markers
//! - A per-topic broadcaster sending full states, then diffs
//! - A service folding engine events into `status`, `job` and `alarm` topics

pub mod broadcaster;
pub mod diff;
pub mod normalizer;
pub mod service;

pub use broadcaster::{PayloadKind, StateBroadcaster, StateSubscriber, TopicMessage};
pub use diff::{apply, diff, StateMap};
pub use normalizer::{
    AxisValues, ControllerState, PlannerBufferState, TelemetryNormalizer, TelemetrySnapshot,
};
pub use service::{TelemetryService, ALARM_TOPIC, JOB_TOPIC, STATUS_TOPIC};
