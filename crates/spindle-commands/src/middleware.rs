//! Per-line interception seam used by the streaming queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spindle_core::{Ack, EngineError, JobEndReason, JobInfo};

/// Position of a line within the running job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineContext {
    /// 1-based program line number
    pub line_number: usize,
    /// Program file name
    pub filename: String,
}

/// What to do with the current line.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "action", content = "text", rename_all = "snake_case")]
pub enum LineAction {
    #[default]
    Keep,
    Replace(String),
    Skip,
}

/// Result of the before-line hooks.
///
/// Injected lines go through the same flow-controlled path as program lines
/// and each is acknowledged before the job moves on.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LineDirective {
    pub action: LineAction,
    /// Sent before the line itself
    #[serde(default)]
    pub inject_before: Vec<String>,
    /// Sent after the line, before the next program line
    #[serde(default)]
    pub inject_after: Vec<String>,
}

impl LineDirective {
    pub fn keep() -> Self {
        Self::default()
    }

    pub fn replace(text: impl Into<String>) -> Self {
        Self {
            action: LineAction::Replace(text.into()),
            ..Self::default()
        }
    }

    pub fn skip() -> Self {
        Self {
            action: LineAction::Skip,
            ..Self::default()
        }
    }

    /// Add lines to send before this one.
    pub fn with_inject_before<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inject_before.extend(lines.into_iter().map(Into::into));
        self
    }

    /// Add lines to send after this one.
    pub fn with_inject_after<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inject_after.extend(lines.into_iter().map(Into::into));
        self
    }

    /// Fold a later directive into this one. A later skip or replace wins;
    /// injections accumulate in order.
    pub fn merge(&mut self, later: LineDirective) {
        if later.action != LineAction::Keep {
            self.action = later.action;
        }
        self.inject_before.extend(later.inject_before);
        self.inject_after.extend(later.inject_after);
    }
}

/// Job interception hooks.
///
/// An `Err` from `before_job` or `before_line` fails the job; the after-hooks
/// cannot fail it.
#[async_trait]
pub trait LineMiddleware: Send + Sync {
    /// Rewrite the whole program before streaming starts.
    async fn before_job(&self, _job: &JobInfo, text: String) -> Result<String, EngineError> {
        Ok(text)
    }

    /// Decide what happens to one program line.
    async fn before_line(
        &self,
        _line: &str,
        _ctx: &LineContext,
    ) -> Result<LineDirective, EngineError> {
        Ok(LineDirective::keep())
    }

    /// Observe an acknowledged program line.
    async fn after_line(&self, _line: &str, _ack: &Ack, _ctx: &LineContext) {}

    /// Observe the end of a job. Called exactly once per job.
    async fn after_job(&self, _job: &JobInfo, _reason: JobEndReason) {}
}

/// Middleware that changes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

#[async_trait]
impl LineMiddleware for PassThrough {}
