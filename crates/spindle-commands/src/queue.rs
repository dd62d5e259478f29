//! Streaming queue.
//!
//! Feeds a G-code job to the protocol session line by line:
//! - each line passes the [`LineMiddleware`] first (keep, rewrite, skip, inject)
//! - a line is written only when it fits the controller receive buffer
//! - injected lines are acknowledged before the next program line goes out
//! - pause, resume and stop are honored between lines
//! - after-line hooks run in order on a side task the stream never waits on
//!
//! The job task is the only writer of job progress; observers read copies via
//! [`StreamingQueue::progress`] or the bus.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use spindle_core::config::StreamingConfig;
use spindle_core::{
    Ack, AckResponse, Command, EngineError, EngineEvent, FilteredReceiver, JobEndReason, JobInfo,
    JobProgress, JobState, LineOrigin, TransportError,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{QueueError, SessionError};
use crate::flow::{FlowController, FlowStats};
use crate::middleware::{LineAction, LineContext, LineMiddleware, PassThrough};
use crate::session::{AckResult, PendingAck, ProtocolSession, SettleHook};

/// Event source name used on the bus.
pub const SOURCE: &str = "queue";

/// A program to stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingJob {
    pub filename: String,
    pub lines: Vec<String>,
}

impl StreamingJob {
    pub fn new(filename: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            filename: filename.into(),
            lines,
        }
    }

    /// Split program text into lines.
    pub fn from_text(filename: impl Into<String>, text: &str) -> Self {
        Self::new(filename, text.lines().map(str::to_string).collect())
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub filename: String,
    pub reason: JobEndReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineError>,
    pub progress: JobProgress,
}

/// Strip `;` and `( )` comments and surrounding whitespace.
pub fn strip_comments(line: &str) -> String {
    let code = line.split(';').next().unwrap_or_default();
    let mut out = String::with_capacity(code.len());
    let mut depth = 0usize;
    for c in code.chars() {
        match c {
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}

/// Rendering of a skipped line in the effective program.
pub fn render_skipped(line: &str) -> String {
    format!("; {} (skipped)", line)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Stop,
}

/// Job state shared between the queue handle and the job task.
struct JobShared {
    state: watch::Sender<JobState>,
    progress: Mutex<JobProgress>,
    outcome: Mutex<Option<JobOutcome>>,
    session: ProtocolSession,
}

impl JobShared {
    fn state(&self) -> JobState {
        *self.state.borrow()
    }

    fn publish(&self, event: EngineEvent) {
        self.session.bus().publish(SOURCE, event);
    }

    /// Move to `to` if `guard` accepts the current state and the transition is
    /// legal. Returns the previous state on success.
    fn try_transition(&self, to: JobState, guard: impl FnOnce(JobState) -> bool) -> Option<JobState> {
        let mut from = None;
        self.state.send_if_modified(|state| {
            if guard(*state) && state.can_transition_to(to) {
                from = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });
        let from = from?;
        let filename = {
            let mut progress = self.progress.lock();
            progress.state = to;
            progress.filename.clone()
        };
        info!(category = "stream", file = %filename, from = %from, to = %to, "Job state changed");
        self.publish(EngineEvent::JobStateChanged { filename, from, to });
        Some(from)
    }

    fn update_progress(&self, update: impl FnOnce(&mut JobProgress)) {
        let progress = {
            let mut progress = self.progress.lock();
            update(&mut progress);
            progress.clone()
        };
        self.publish(EngineEvent::JobProgress { progress });
    }
}

/// Flow-controlled write path shared by the job task and out-of-job senders
/// such as plugins.
#[derive(Clone)]
pub struct QueueSender {
    session: ProtocolSession,
    flow: Arc<FlowController>,
    shared: Arc<JobShared>,
}

impl QueueSender {
    /// Send a command through flow control and wait for its acknowledgement.
    ///
    /// While a job is active the line is reported as injected.
    pub async fn send(&self, command: Command) -> Result<Ack, QueueError> {
        if command.is_realtime() {
            return Ok(self.session.send(command).await?);
        }
        let origin = if self.shared.state().is_active() {
            LineOrigin::Injected
        } else {
            LineOrigin::Console
        };
        let cost = self.cost_of(&command)?;
        self.flow.reserve(cost).await;
        let pending = self.write_reserved(command, cost, origin, None).await?;
        Ok(pending.wait().await?)
    }

    fn cost_of(&self, command: &Command) -> Result<usize, QueueError> {
        let cost = command.wire_len(self.session.terminator());
        if cost > self.flow.capacity() {
            return Err(QueueError::LineTooLong {
                cost,
                capacity: self.flow.capacity(),
            });
        }
        Ok(cost)
    }

    /// Write a command whose bytes are already reserved. The reservation is
    /// returned when the command settles or the write fails.
    async fn write_reserved(
        &self,
        command: Command,
        cost: usize,
        origin: LineOrigin,
        then: Option<SettleHook>,
    ) -> Result<PendingAck, QueueError> {
        let flow = self.flow.clone();
        let hook: SettleHook = Box::new(move |result: &AckResult| {
            flow.release(cost);
            if let Some(then) = then {
                then(result);
            }
        });
        let text = command.text.clone();
        let line_number = command
            .meta
            .get("line")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize);

        match self.session.write_with_hook(command, hook).await {
            Ok(pending) => {
                self.shared.publish(EngineEvent::LineSent {
                    line_number,
                    text,
                    origin,
                });
                Ok(pending)
            }
            Err(e) => {
                self.flow.release(cost);
                Err(e.into())
            }
        }
    }
}

/// Streaming queue for one connection.
#[derive(Clone)]
pub struct StreamingQueue {
    sender: QueueSender,
    middleware: Arc<dyn LineMiddleware>,
    settle_timeout: Duration,
    control: Arc<Mutex<Option<watch::Sender<Control>>>>,
}

impl StreamingQueue {
    pub fn new(session: ProtocolSession, config: &StreamingConfig) -> Self {
        let (state, _) = watch::channel(JobState::Idle);
        let shared = Arc::new(JobShared {
            state,
            progress: Mutex::new(JobProgress::default()),
            outcome: Mutex::new(None),
            session: session.clone(),
        });
        Self {
            sender: QueueSender {
                session,
                flow: Arc::new(FlowController::new(config.buffer_capacity)),
                shared,
            },
            middleware: Arc::new(PassThrough),
            settle_timeout: Duration::from_millis(config.stop_settle_timeout_ms),
            control: Arc::new(Mutex::new(None)),
        }
    }

    /// Route every job line through `middleware`.
    pub fn with_middleware(mut self, middleware: Arc<dyn LineMiddleware>) -> Self {
        self.middleware = middleware;
        self
    }

    /// Flow-controlled write path for sending outside the job loop.
    pub fn sender(&self) -> QueueSender {
        self.sender.clone()
    }

    /// Send a command through flow control and wait for its acknowledgement.
    pub async fn send_command(&self, command: Command) -> Result<Ack, QueueError> {
        self.sender.send(command).await
    }

    pub fn state(&self) -> JobState {
        self.sender.shared.state()
    }

    /// Copy of the current progress counters.
    pub fn progress(&self) -> JobProgress {
        self.sender.shared.progress.lock().clone()
    }

    pub fn flow_stats(&self) -> FlowStats {
        self.sender.flow.stats()
    }

    /// Start streaming a job.
    pub fn start(&self, job: StreamingJob) -> Result<(), QueueError> {
        let mut control = self.control.lock();
        let shared = &self.sender.shared;
        if shared.state().is_active() {
            return Err(QueueError::AlreadyRunning);
        }
        {
            let mut progress = shared.progress.lock();
            *progress = JobProgress {
                filename: job.filename.clone(),
                state: shared.state(),
                total: job.lines.len(),
                ..JobProgress::default()
            };
        }
        *shared.outcome.lock() = None;
        if shared
            .try_transition(JobState::Running, |s| !s.is_active())
            .is_none()
        {
            return Err(QueueError::AlreadyRunning);
        }

        let (control_tx, control_rx) = watch::channel(Control::Run);
        *control = Some(control_tx);
        drop(control);

        let (settle_tx, settle_rx) = mpsc::unbounded_channel();
        let (after_tx, after_task) = spawn_after_line(self.middleware.clone());
        let closed = shared
            .session
            .bus()
            .subscribe_filtered(|event| matches!(event, EngineEvent::ConnectionClosed { .. }));
        let info = JobInfo {
            filename: job.filename,
            total_lines: job.lines.len(),
            started_at: Utc::now(),
        };
        info!(category = "stream", file = %info.filename, lines = info.total_lines, "Starting job");

        let runner = JobRunner {
            info,
            sender: self.sender.clone(),
            middleware: self.middleware.clone(),
            control: control_rx,
            settle_tx,
            settle_rx,
            after_tx: Some(after_tx),
            after_task: Some(after_task),
            closed,
            outstanding: 0,
            settle_timeout: self.settle_timeout,
        };
        tokio::spawn(runner.run(job.lines.join("\n")));
        Ok(())
    }

    /// Stop sending new lines. In-flight lines still complete.
    pub fn pause(&self) -> Result<(), QueueError> {
        self.switch(Control::Pause, JobState::Running, JobState::Paused, "pause")
    }

    /// Continue a paused job.
    pub fn resume(&self) -> Result<(), QueueError> {
        self.switch(Control::Run, JobState::Paused, JobState::Running, "resume")
    }

    fn switch(
        &self,
        control: Control,
        from: JobState,
        to: JobState,
        action: &'static str,
    ) -> Result<(), QueueError> {
        let guard = self.control.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(QueueError::NoActiveJob);
        };
        if *tx.borrow() == Control::Stop {
            return Err(QueueError::InvalidTransition {
                action,
                state: self.state(),
            });
        }
        if self
            .sender
            .shared
            .try_transition(to, |s| s == from)
            .is_none()
        {
            return Err(QueueError::InvalidTransition {
                action,
                state: self.state(),
            });
        }
        tx.send_replace(control);
        Ok(())
    }

    /// Stop the job: no new lines, feed hold and flush, then wait for the
    /// in-flight lines to settle.
    pub async fn stop(&self) -> Result<JobOutcome, QueueError> {
        if !self.state().is_active() {
            return Err(QueueError::NoActiveJob);
        }
        if let Some(tx) = self.control.lock().as_ref() {
            tx.send_replace(Control::Stop);
        }
        self.wait().await.ok_or(QueueError::NoActiveJob)
    }

    /// Wait for the current job to end. Returns the last outcome, if any.
    pub async fn wait(&self) -> Option<JobOutcome> {
        let mut rx = self.sender.shared.state.subscribe();
        rx.wait_for(|state| !state.is_active()).await.ok()?;
        self.sender.shared.outcome.lock().clone()
    }
}

/// A program line whose command settled.
struct Settled {
    line_number: usize,
    text: String,
    result: AckResult,
}

enum Interrupt {
    Stop,
    Fail(EngineError),
}

/// One after-line hook call, queued for the hook task.
struct AfterLine {
    text: String,
    ack: Ack,
    ctx: LineContext,
}

/// Run after-line hooks in settle order without holding up the stream.
fn spawn_after_line(
    middleware: Arc<dyn LineMiddleware>,
) -> (mpsc::UnboundedSender<AfterLine>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<AfterLine>();
    let task = tokio::spawn(async move {
        while let Some(call) = rx.recv().await {
            middleware.after_line(&call.text, &call.ack, &call.ctx).await;
        }
    });
    (tx, task)
}

struct JobRunner {
    info: JobInfo,
    sender: QueueSender,
    middleware: Arc<dyn LineMiddleware>,
    control: watch::Receiver<Control>,
    settle_tx: mpsc::UnboundedSender<Settled>,
    settle_rx: mpsc::UnboundedReceiver<Settled>,
    after_tx: Option<mpsc::UnboundedSender<AfterLine>>,
    after_task: Option<JoinHandle<()>>,
    closed: FilteredReceiver,
    /// Program lines written but not yet settled
    outstanding: usize,
    settle_timeout: Duration,
}

impl JobRunner {
    async fn run(mut self, text: String) {
        let (reason, error) = match self.stream(text).await {
            Ok(()) => (JobEndReason::Completed, None),
            Err(Interrupt::Stop) => {
                self.settle_after_stop().await;
                (JobEndReason::Stopped, None)
            }
            Err(Interrupt::Fail(err)) => {
                warn!(category = "stream", file = %self.info.filename, error = %err, "Job failed");
                (JobEndReason::Error, Some(err))
            }
        };

        self.drain_after_line().await;
        self.middleware.after_job(&self.info, reason).await;

        let shared = self.sender.shared.clone();
        let progress = shared.progress.lock().clone();
        *shared.outcome.lock() = Some(JobOutcome {
            filename: self.info.filename.clone(),
            reason,
            error: error.clone(),
            progress,
        });
        shared.publish(EngineEvent::JobFinished {
            filename: self.info.filename.clone(),
            reason,
            error: error.map(|e| e.to_string()),
        });
        info!(category = "stream", file = %self.info.filename, reason = reason.as_str(), "Job finished");
        shared.try_transition(reason.terminal_state(), |_| true);
    }

    /// Close the hook queue and wait for the queued after-line calls.
    async fn drain_after_line(&mut self) {
        self.after_tx = None;
        if let Some(task) = self.after_task.take() {
            if let Err(e) = task.await {
                warn!(category = "stream", error = %e, "After-line hook task failed");
            }
        }
    }

    fn defer_after_line(&self, line_number: usize, text: String, ack: Ack) {
        if let Some(tx) = &self.after_tx {
            let _ = tx.send(AfterLine {
                text,
                ack,
                ctx: self.ctx(line_number),
            });
        }
    }

    fn ctx(&self, line_number: usize) -> LineContext {
        LineContext {
            line_number,
            filename: self.info.filename.clone(),
        }
    }

    async fn stream(&mut self, text: String) -> Result<(), Interrupt> {
        let text = self
            .middleware
            .before_job(&self.info, text)
            .await
            .map_err(Interrupt::Fail)?;
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        self.info.total_lines = lines.len();
        self.sender
            .shared
            .update_progress(|p| p.total = lines.len());

        for (index, raw) in lines.iter().enumerate() {
            let line_number = index + 1;
            self.checkpoint().await?;
            self.sender.shared.update_progress(|p| p.cursor = line_number);

            let line = strip_comments(raw);
            if line.is_empty() {
                self.sender.shared.update_progress(|p| p.skipped += 1);
                continue;
            }

            let directive = self
                .middleware
                .before_line(&line, &self.ctx(line_number))
                .await
                .map_err(Interrupt::Fail)?;

            for extra in &directive.inject_before {
                self.send_injected(extra).await?;
            }

            let effective = match directive.action {
                LineAction::Keep => Some(line.clone()),
                LineAction::Replace(text) => Some(strip_comments(&text)).filter(|t| !t.is_empty()),
                LineAction::Skip => None,
            };
            match effective {
                Some(text) => self.send_line(line_number, text).await?,
                None => self.skip_line(line_number, &line),
            }

            for extra in &directive.inject_after {
                self.send_injected(extra).await?;
            }
        }

        self.complete().await
    }

    /// Apply settled acks, then honor pause and stop. A closed link fails
    /// the job, paused or not.
    async fn checkpoint(&mut self) -> Result<(), Interrupt> {
        while let Ok(settled) = self.settle_rx.try_recv() {
            self.handle_settled(settled)?;
        }
        if let Some((EngineEvent::ConnectionClosed { reason }, _)) = self.closed.try_recv() {
            return Err(link_closed(reason));
        }
        loop {
            let control = *self.control.borrow_and_update();
            match control {
                Control::Run => return Ok(()),
                Control::Stop => return Err(Interrupt::Stop),
                Control::Pause => {
                    if !self.sender.session.is_open() {
                        return Err(link_closed("link closed while paused".to_string()));
                    }
                    tokio::select! {
                        Some(settled) = self.settle_rx.recv() => self.handle_settled(settled)?,
                        changed = self.control.changed() => {
                            if changed.is_err() {
                                return Err(Interrupt::Stop);
                            }
                        }
                        Some((EngineEvent::ConnectionClosed { reason }, _)) = self.closed.recv() => {
                            return Err(link_closed(reason));
                        }
                    }
                }
            }
        }
    }

    fn handle_settled(&mut self, settled: Settled) -> Result<(), Interrupt> {
        self.outstanding = self.outstanding.saturating_sub(1);
        let Settled {
            line_number,
            text,
            result,
        } = settled;
        let ack = result.map_err(|e| Interrupt::Fail(e.into()))?;
        let response = ack.response;
        self.defer_after_line(line_number, text, ack);

        match response {
            AckResponse::Ok => {
                self.sender
                    .shared
                    .update_progress(|p| p.acknowledged += 1);
                Ok(())
            }
            AckResponse::Error(code) => {
                warn!(
                    category = "stream",
                    line = line_number,
                    code,
                    "Controller rejected job line"
                );
                Err(Interrupt::Fail(EngineError::controller(code)))
            }
        }
    }

    /// Wait for room in the controller buffer while still reacting to acks
    /// and to stop requests.
    async fn reserve(&mut self, cost: usize) -> Result<(), Interrupt> {
        let flow = self.sender.flow.clone();
        loop {
            tokio::select! {
                biased;
                _ = flow.reserve(cost) => return Ok(()),
                Some(settled) = self.settle_rx.recv() => self.handle_settled(settled)?,
                changed = self.control.changed() => {
                    if changed.is_err() || *self.control.borrow() == Control::Stop {
                        return Err(Interrupt::Stop);
                    }
                }
            }
        }
    }

    fn cost(&self, command: &Command) -> Result<usize, Interrupt> {
        self.sender
            .cost_of(command)
            .map_err(|e| Interrupt::Fail(e.into()))
    }

    async fn send_line(&mut self, line_number: usize, text: String) -> Result<(), Interrupt> {
        let command = Command::gcode(text).with_meta("line", serde_json::json!(line_number));
        let cost = self.cost(&command)?;
        self.reserve(cost).await?;

        let settle_tx = self.settle_tx.clone();
        let settled_text = command.text.clone();
        let then: SettleHook = Box::new(move |result: &AckResult| {
            let _ = settle_tx.send(Settled {
                line_number,
                text: settled_text,
                result: result.clone(),
            });
        });
        self.sender
            .write_reserved(command, cost, LineOrigin::Job, Some(then))
            .await
            .map_err(|e| Interrupt::Fail(e.into()))?;

        self.outstanding += 1;
        self.sender.shared.update_progress(|p| p.sent += 1);
        Ok(())
    }

    fn skip_line(&mut self, line_number: usize, line: &str) {
        let rendered = render_skipped(line);
        debug!(category = "stream", line = line_number, rendered = %rendered, "Skipping line");
        self.sender.shared.publish(EngineEvent::LineSkipped {
            line_number,
            rendered,
        });
        self.sender.shared.update_progress(|p| p.skipped += 1);
    }

    /// Send one injected line and wait for its ack.
    async fn send_injected(&mut self, text: &str) -> Result<(), Interrupt> {
        let command = Command::gcode(strip_comments(text));
        if command.text.is_empty() {
            return Ok(());
        }
        let cost = self.cost(&command)?;
        self.reserve(cost).await?;
        let pending = self
            .sender
            .write_reserved(command, cost, LineOrigin::Injected, None)
            .await
            .map_err(|e| Interrupt::Fail(e.into()))?;

        let ack = pending.wait();
        tokio::pin!(ack);
        let result = loop {
            tokio::select! {
                result = &mut ack => break result,
                Some(settled) = self.settle_rx.recv() => self.handle_settled(settled)?,
                changed = self.control.changed() => {
                    if changed.is_err() || *self.control.borrow() == Control::Stop {
                        return Err(Interrupt::Stop);
                    }
                }
            }
        };

        match result {
            Ok(ack) => match ack.response {
                AckResponse::Ok => Ok(()),
                AckResponse::Error(code) => Err(Interrupt::Fail(EngineError::controller(code))),
            },
            Err(err) => Err(Interrupt::Fail(err.into())),
        }
    }

    /// All lines accepted: wait for the remaining acks.
    async fn complete(&mut self) -> Result<(), Interrupt> {
        loop {
            self.checkpoint().await?;
            if self
                .sender
                .shared
                .try_transition(JobState::Completing, |s| s == JobState::Running)
                .is_some()
            {
                break;
            }
        }
        while self.outstanding > 0 {
            tokio::select! {
                Some(settled) = self.settle_rx.recv() => self.handle_settled(settled)?,
                changed = self.control.changed() => {
                    if changed.is_err() || *self.control.borrow() == Control::Stop {
                        return Err(Interrupt::Stop);
                    }
                }
            }
        }
        Ok(())
    }

    /// Feed hold and flush, then give in-flight lines a bounded time to settle.
    async fn settle_after_stop(&mut self) {
        if let Err(e) = self.sender.session.halt().await {
            warn!(category = "stream", error = %e, "Halt failed");
        }
        let settle_rx = &mut self.settle_rx;
        let outstanding = &mut self.outstanding;
        let after_tx = &self.after_tx;
        let filename = &self.info.filename;
        let drained = tokio::time::timeout(self.settle_timeout, async {
            while *outstanding > 0 {
                match settle_rx.recv().await {
                    Some(settled) => {
                        *outstanding -= 1;
                        match settled.result {
                            Ok(ack) => {
                                if let Some(tx) = after_tx {
                                    let _ = tx.send(AfterLine {
                                        text: settled.text,
                                        ack,
                                        ctx: LineContext {
                                            line_number: settled.line_number,
                                            filename: filename.clone(),
                                        },
                                    });
                                }
                            }
                            Err(SessionError::ControllerReset) => {
                                debug!(category = "stream", line = settled.line_number, "Flushed by reset");
                            }
                            Err(_) => {}
                        }
                    }
                    None => break,
                }
            }
        })
        .await;
        if drained.is_err() {
            let dropped = self.sender.session.abandon_in_flight("job stopped");
            warn!(category = "stream", dropped, "In-flight lines did not settle after stop");
        }
    }
}

fn link_closed(reason: String) -> Interrupt {
    Interrupt::Fail(EngineError::Transport(TransportError::Closed(reason)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comments() {
        assert_eq!(strip_comments("G1 X10 ; move"), "G1 X10");
        assert_eq!(strip_comments("(header) G0 X1 (fast) Y2"), "G0 X1  Y2");
        assert_eq!(strip_comments("; only a comment"), "");
        assert_eq!(strip_comments("   "), "");
    }

    #[test]
    fn test_render_skipped() {
        assert_eq!(render_skipped("M8"), "; M8 (skipped)");
    }

    #[test]
    fn test_job_from_text() {
        let job = StreamingJob::from_text("a.nc", "G0 X1\nG0 X2\n");
        assert_eq!(job.lines, vec!["G0 X1", "G0 X2"]);
    }
}
