//! Streaming job lifecycle types shared by the queue, the plugin pipeline and
//! observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Streaming job state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// No job loaded
    #[default]
    Idle,
    /// Lines are being fed to the controller
    Running,
    /// No new lines are sent; in-flight lines still complete
    Paused,
    /// All lines sent, waiting for the final acknowledgements
    Completing,
    /// Stopped on request
    Stopped,
    /// Failed on a transport, controller or plugin error
    Failed,
}

impl JobState {
    /// Check if a job occupies the queue in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Running | JobState::Paused | JobState::Completing
        )
    }

    /// Check if the transition `self -> next` is allowed.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Idle | Stopped | Failed, Running)
                | (Running, Paused | Completing | Stopped | Failed)
                | (Paused, Running | Stopped | Failed)
                | (Completing, Idle | Stopped | Failed)
                | (Stopped | Failed, Idle)
        )
    }

    /// Get the state name.
    pub fn type_name(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Completing => "completing",
            JobState::Stopped => "stopped",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Why a job ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobEndReason {
    Completed,
    Stopped,
    Error,
}

impl JobEndReason {
    /// Get the reason code.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEndReason::Completed => "completed",
            JobEndReason::Stopped => "stopped",
            JobEndReason::Error => "error",
        }
    }

    /// The terminal job state for this reason.
    pub fn terminal_state(&self) -> JobState {
        match self {
            JobEndReason::Completed => JobState::Idle,
            JobEndReason::Stopped => JobState::Stopped,
            JobEndReason::Error => JobState::Failed,
        }
    }
}

/// Where a transmitted line came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LineOrigin {
    /// An original program line (possibly rewritten by a plugin)
    Job,
    /// A line injected by a plugin between two program lines
    Injected,
    /// A command sent outside of any job
    Console,
}

/// Immutable job description handed to observers and plugin hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    /// Program file name
    pub filename: String,
    /// Number of program lines
    pub total_lines: usize,
    /// When streaming started
    pub started_at: DateTime<Utc>,
}

/// Progress counters for the running job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobProgress {
    /// Program file name
    pub filename: String,
    /// Current job state
    pub state: JobState,
    /// Lines accepted into the pipeline (the cursor)
    pub cursor: usize,
    /// Program lines written to the controller
    pub sent: usize,
    /// Program lines acknowledged
    pub acknowledged: usize,
    /// Program lines skipped by plugins or empty after comment stripping
    pub skipped: usize,
    /// Number of program lines
    pub total: usize,
}

impl JobProgress {
    /// Completion ratio in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.acknowledged + self.skipped) as f64 / self.total as f64
    }
}
