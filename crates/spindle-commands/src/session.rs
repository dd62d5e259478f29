//! Protocol session.
//!
//! Owns the byte-stream to line-protocol boundary for one connection:
//! - ack-tracked writes, matched to `ok` / `error:N` strictly FIFO
//! - an outstanding-command limit that suspends writers (back-pressure)
//! - real-time bytes that bypass tracking entirely
//! - one bus event per classified controller line

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use spindle_core::config::SessionConfig;
use spindle_core::{
    describe_alarm, describe_error, Ack, AckResponse, AlarmLookup, Command, CommandId,
    CommandKind, EngineEvent, EventBus, RealtimeCommand, TransportError,
};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::protocol::{classify, ControllerLine, LineBuffer};
use crate::transport::{Transport, TransportEvent, TransportEvents};

/// Event source name used on the bus.
pub const SOURCE: &str = "session";

/// Outcome of an ack-tracked write.
pub type AckResult = Result<Ack, SessionError>;

/// Callback run on the reader side when a command settles, before its waiter
/// is woken.
pub type SettleHook = Box<dyn FnOnce(&AckResult) + Send>;

/// Handle to the acknowledgement of one written command.
pub struct PendingAck {
    command_id: CommandId,
    rx: oneshot::Receiver<AckResult>,
}

impl PendingAck {
    fn resolved(command_id: CommandId, result: AckResult) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { command_id, rx }
    }

    /// ID of the written command.
    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    /// Wait for the controller response.
    pub async fn wait(self) -> AckResult {
        self.rx.await.unwrap_or(Err(SessionError::Closed))
    }
}

struct InFlight {
    command: Command,
    reply: oneshot::Sender<AckResult>,
    on_settle: Option<SettleHook>,
}

impl InFlight {
    fn settle(self, result: AckResult) {
        if let Some(hook) = self.on_settle {
            hook(&result);
        }
        let _ = self.reply.send(result);
    }
}

struct SessionInner {
    transport: Arc<dyn Transport>,
    terminator: String,
    outstanding_limit: usize,
    slots: Semaphore,
    write_lock: tokio::sync::Mutex<()>,
    in_flight: Mutex<VecDeque<InFlight>>,
    alarms: RwLock<Option<Arc<dyn AlarmLookup>>>,
    bus: EventBus,
}

/// Protocol session for one controller connection.
#[derive(Clone)]
pub struct ProtocolSession {
    inner: Arc<SessionInner>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ProtocolSession {
    /// Create a session over an open transport. No reader is attached yet.
    pub fn new(transport: Arc<dyn Transport>, bus: EventBus, config: &SessionConfig) -> Self {
        let limit = config.outstanding_limit.max(1);
        Self {
            inner: Arc::new(SessionInner {
                transport,
                terminator: config.line_terminator.clone(),
                outstanding_limit: limit,
                slots: Semaphore::new(limit),
                write_lock: tokio::sync::Mutex::new(()),
                in_flight: Mutex::new(VecDeque::new()),
                alarms: RwLock::new(None),
                bus,
            }),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a session and start reading the link.
    pub fn connect(
        transport: Arc<dyn Transport>,
        events: TransportEvents,
        bus: EventBus,
        config: &SessionConfig,
    ) -> Self {
        let session = Self::new(transport, bus, config);
        session.attach(events);
        session
    }

    /// Spawn the reader task for the link's events.
    pub fn attach(&self, mut events: TransportEvents) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut buffer = LineBuffer::new();
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Data(bytes) => {
                        for line in buffer.push(&bytes) {
                            inner.handle_line(&line);
                        }
                    }
                    TransportEvent::Closed(reason) => {
                        inner.handle_closed(reason);
                        return;
                    }
                }
            }
            inner.handle_closed("transport dropped".to_string());
        });
        self.tasks.lock().push(handle);
    }

    /// Send `?` at a fixed interval while the link is open. A zero interval
    /// disables polling.
    pub fn start_status_poll(&self, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let session = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !session.is_open() {
                    break;
                }
                if let Err(e) = session.realtime(RealtimeCommand::StatusQuery).await {
                    debug!(category = "protocol", error = %e, "Status poll stopped");
                    break;
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Stop the reader and poller tasks.
    pub fn shutdown(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    /// The event bus this session publishes on.
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Line terminator appended to tracked writes.
    pub fn terminator(&self) -> &str {
        &self.inner.terminator
    }

    /// Check if the underlying link is open.
    pub fn is_open(&self) -> bool {
        self.inner.transport.is_open()
    }

    /// Configured outstanding-command limit.
    pub fn outstanding_limit(&self) -> usize {
        self.inner.outstanding_limit
    }

    /// Number of un-acknowledged writes.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Install the alarm catalog used to describe `ALARM:N` lines.
    pub fn set_alarm_lookup(&self, lookup: Arc<dyn AlarmLookup>) {
        *self.inner.alarms.write() = Some(lookup);
    }

    /// Write a command and track it until acknowledged.
    ///
    /// Suspends while the outstanding-command limit is reached. Real-time
    /// commands are written immediately and resolve at once.
    pub async fn write(&self, command: Command) -> Result<PendingAck, SessionError> {
        self.write_tracked(command, None).await
    }

    /// Like [`write`](Self::write), running `on_settle` when the command
    /// settles. The hook is not run if the write itself fails.
    pub async fn write_with_hook(
        &self,
        command: Command,
        on_settle: SettleHook,
    ) -> Result<PendingAck, SessionError> {
        self.write_tracked(command, Some(on_settle)).await
    }

    /// Write a command and wait for its acknowledgement.
    pub async fn send(&self, command: Command) -> AckResult {
        self.write(command).await?.wait().await
    }

    /// Write a real-time byte, bypassing ack tracking and back-pressure.
    pub async fn realtime(&self, command: RealtimeCommand) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen.into());
        }
        debug!(category = "protocol", command = %command, "Realtime command");
        self.inner.transport.write(&[command.byte()]).await?;
        Ok(())
    }

    /// Feed hold followed by a soft reset. The controller answers the reset
    /// with its banner, which flushes everything still in flight.
    pub async fn halt(&self) -> Result<(), SessionError> {
        self.realtime(RealtimeCommand::FeedHold).await?;
        self.realtime(RealtimeCommand::SoftReset).await
    }

    /// Settle every in-flight command as abandoned. Returns how many were dropped.
    pub fn abandon_in_flight(&self, reason: &str) -> usize {
        self.inner
            .flush(SessionError::Abandoned(reason.to_string()))
    }

    /// Process one received line. The reader task calls this for every line.
    pub fn on_line(&self, raw: &str) {
        self.inner.handle_line(raw);
    }

    async fn write_tracked(
        &self,
        command: Command,
        on_settle: Option<SettleHook>,
    ) -> Result<PendingAck, SessionError> {
        if let CommandKind::Realtime(rt) = command.kind {
            self.realtime(rt).await?;
            let result = Ok(Ack::new(&command, AckResponse::Ok));
            if let Some(hook) = on_settle {
                hook(&result);
            }
            return Ok(PendingAck::resolved(command.id, result));
        }

        let inner = &self.inner;
        if !inner.transport.is_open() {
            return Err(TransportError::NotOpen.into());
        }

        let permit = inner
            .slots
            .acquire()
            .await
            .map_err(|_| SessionError::Closed)?;

        let _guard = inner.write_lock.lock().await;
        if !inner.transport.is_open() {
            return Err(TransportError::NotOpen.into());
        }

        let bytes = command.to_wire(&inner.terminator);
        let command_id = command.id.clone();
        let (tx, rx) = oneshot::channel();
        debug!(category = "protocol", id = %command_id, text = %command.text, "Write");

        // In-flight order must equal wire order: push before writing, under the write lock.
        inner.in_flight.lock().push_back(InFlight {
            command,
            reply: tx,
            on_settle,
        });
        // The slot now belongs to the entry and comes back when it settles.
        permit.forget();
        let unsent = UnsentWrite {
            inner,
            command_id: Some(command_id.clone()),
        };

        if let Err(e) = inner.transport.write(&bytes).await {
            warn!(category = "protocol", error = %e, "Write failed");
            return Err(e.into());
        }
        unsent.disarm();

        Ok(PendingAck { command_id, rx })
    }
}

/// Withdraws an in-flight entry whose bytes never finished writing, either
/// because the write failed or because the writer was dropped mid-write.
struct UnsentWrite<'a> {
    inner: &'a SessionInner,
    command_id: Option<CommandId>,
}

impl UnsentWrite<'_> {
    fn disarm(mut self) {
        self.command_id = None;
    }
}

impl Drop for UnsentWrite<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.command_id.take() {
            if self.inner.withdraw(&id) {
                debug!(category = "protocol", id = %id, "Withdrew unsent command");
            }
        }
    }
}

impl SessionInner {
    /// Remove an in-flight entry and return its slot.
    fn withdraw(&self, command_id: &str) -> bool {
        let removed = {
            let mut queue = self.in_flight.lock();
            queue
                .iter()
                .position(|entry| entry.command.id == command_id)
                .and_then(|index| queue.remove(index))
        };
        if removed.is_some() {
            self.slots.add_permits(1);
        }
        removed.is_some()
    }

    fn publish(&self, event: EngineEvent) {
        self.bus.publish(SOURCE, event);
    }

    fn handle_line(&self, raw: &str) {
        let Some(line) = classify(raw) else {
            return;
        };

        match line {
            ControllerLine::Ok => self.acknowledge(raw, AckResponse::Ok),
            ControllerLine::Error(code) => self.acknowledge(raw, AckResponse::Error(code)),
            ControllerLine::Alarm(code) => {
                let lookup = self.alarms.read().clone();
                let description = describe_alarm(lookup.as_deref(), code);
                warn!(category = "protocol", code, description = %description, "Alarm raised");
                self.publish(EngineEvent::AlarmRaised { code, description });
            }
            ControllerLine::Status(report) => {
                self.publish(EngineEvent::StatusReport { report });
            }
            ControllerLine::Welcome(banner) => {
                let dropped = self.flush(SessionError::ControllerReset);
                if dropped > 0 {
                    warn!(category = "protocol", dropped, "Controller reset with commands in flight");
                } else {
                    info!(category = "protocol", banner = %banner, "Controller ready");
                }
                self.publish(EngineEvent::ControllerReset { banner, dropped });
            }
            ControllerLine::System(message) => {
                self.publish(EngineEvent::SystemMessage { message });
            }
            ControllerLine::Malformed { line, reason } => {
                warn!(category = "protocol", line = %line, reason = %reason, "Discarding line");
                self.publish(EngineEvent::ProtocolError { line, reason });
            }
            ControllerLine::Unmatched(line) => {
                debug!(category = "protocol", line = %line, "Unmatched line");
                self.publish(EngineEvent::Unmatched { line });
            }
        }
    }

    fn acknowledge(&self, raw: &str, response: AckResponse) {
        let entry = self.in_flight.lock().pop_front();
        let Some(entry) = entry else {
            warn!(category = "protocol", line = %raw, "Acknowledgement with nothing in flight");
            self.publish(EngineEvent::ProtocolError {
                line: raw.trim().to_string(),
                reason: "acknowledgement with no command in flight".to_string(),
            });
            return;
        };
        self.slots.add_permits(1);

        if let AckResponse::Error(code) = response {
            warn!(
                category = "protocol",
                code,
                text = %entry.command.text,
                description = describe_error(code),
                "Controller rejected command"
            );
        }

        let ack = Ack::new(&entry.command, response);
        let event = EngineEvent::Acknowledged {
            command_id: ack.command_id.clone(),
            text: ack.text.clone(),
            response,
        };
        entry.settle(Ok(ack));
        self.publish(event);
    }

    fn flush(&self, error: SessionError) -> usize {
        let drained: Vec<InFlight> = self.in_flight.lock().drain(..).collect();
        let count = drained.len();
        if count > 0 {
            self.slots.add_permits(count);
        }
        for entry in drained {
            entry.settle(Err(error.clone()));
        }
        count
    }

    fn handle_closed(&self, reason: String) {
        let dropped = self.flush(SessionError::Transport(TransportError::Closed(reason.clone())));
        warn!(category = "protocol", reason = %reason, dropped, "Connection closed");
        self.publish(EngineEvent::ConnectionClosed { reason });
    }
}
