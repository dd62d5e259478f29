//! Jog dead-man watchdog.
//!
//! Armed while a continuous jog is outstanding. If no heartbeat extends it
//! within the timeout, the timeout callback fires exactly once and is
//! expected to cancel the jog with a real-time command.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use spindle_core::{CommandId, EngineEvent, EventBus};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Reason passed to the timeout callback.
pub const TIMEOUT_REASON: &str = "watchdog-timeout";

/// Event source name used on the bus.
pub const SOURCE: &str = "watchdog";

/// Timeout callback: `(command_id, reason)`.
pub type TimeoutCallback = Arc<dyn Fn(CommandId, &'static str) -> BoxFuture<'static, ()> + Send + Sync>;

/// The armed watchdog.
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogSession {
    pub active_command_id: CommandId,
    pub armed_at: DateTime<Utc>,
    pub timeout_ms: u64,
    #[serde(skip)]
    deadline: Instant,
    #[serde(skip)]
    generation: u64,
}

#[derive(Default)]
struct WatchdogState {
    session: Option<WatchdogSession>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

/// Dead-man timer for continuous jogging. One session at a time.
#[derive(Clone)]
pub struct JogWatchdog {
    timeout: Duration,
    state: Arc<Mutex<WatchdogState>>,
    on_timeout: TimeoutCallback,
    bus: Option<EventBus>,
}

impl JogWatchdog {
    pub fn new(timeout: Duration, on_timeout: TimeoutCallback) -> Self {
        Self {
            timeout,
            state: Arc::new(Mutex::new(WatchdogState::default())),
            on_timeout,
            bus: None,
        }
    }

    /// Publish arm, clear and timeout events on `bus`.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().session.is_some()
    }

    /// Copy of the armed session, if any.
    pub fn session(&self) -> Option<WatchdogSession> {
        self.state.lock().session.clone()
    }

    /// Arm for `command_id`. An armed session is cleared first.
    pub fn start(&self, command_id: impl Into<CommandId>) {
        let command_id = command_id.into();
        let previous = {
            let mut state = self.state.lock();
            let previous = Self::disarm(&mut state);

            state.generation += 1;
            let generation = state.generation;
            state.session = Some(WatchdogSession {
                active_command_id: command_id.clone(),
                armed_at: Utc::now(),
                timeout_ms: self.timeout.as_millis() as u64,
                deadline: Instant::now() + self.timeout,
                generation,
            });
            state.timer = Some(tokio::spawn(Self::run_timer(
                self.state.clone(),
                generation,
                self.on_timeout.clone(),
                self.bus.clone(),
            )));
            previous
        };

        if let Some(previous) = previous {
            self.publish(EngineEvent::WatchdogCleared {
                command_id: previous.active_command_id,
            });
        }
        debug!(category = "watchdog", id = %command_id, "Watchdog armed");
        self.publish(EngineEvent::WatchdogArmed {
            command_id,
            timeout_ms: self.timeout.as_millis() as u64,
        });
    }

    /// Push the deadline out by a full timeout. Returns `false` when not armed.
    pub fn extend(&self) -> bool {
        let mut state = self.state.lock();
        match state.session.as_mut() {
            Some(session) => {
                session.deadline = Instant::now() + self.timeout;
                true
            }
            None => false,
        }
    }

    /// Disarm. Returns `false` when not armed.
    pub fn clear(&self) -> bool {
        let previous = Self::disarm(&mut self.state.lock());
        match previous {
            Some(session) => {
                debug!(category = "watchdog", id = %session.active_command_id, "Watchdog cleared");
                self.publish(EngineEvent::WatchdogCleared {
                    command_id: session.active_command_id,
                });
                true
            }
            None => false,
        }
    }

    fn disarm(state: &mut WatchdogState) -> Option<WatchdogSession> {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.session.take()
    }

    fn publish(&self, event: EngineEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(SOURCE, event);
        }
    }

    async fn run_timer(
        state: Arc<Mutex<WatchdogState>>,
        generation: u64,
        on_timeout: TimeoutCallback,
        bus: Option<EventBus>,
    ) {
        loop {
            let deadline = match state.lock().session.as_ref() {
                Some(session) if session.generation == generation => session.deadline,
                _ => return,
            };
            tokio::time::sleep_until(deadline).await;

            let expired = {
                let mut state = state.lock();
                match state.session.as_ref() {
                    Some(session) if session.generation != generation => return,
                    None => return,
                    Some(session) if Instant::now() < session.deadline => None,
                    Some(_) => {
                        state.timer = None;
                        state.session.take()
                    }
                }
            };

            if let Some(session) = expired {
                warn!(
                    category = "watchdog",
                    id = %session.active_command_id,
                    timeout_ms = session.timeout_ms,
                    "No jog heartbeat, cancelling jog"
                );
                if let Some(bus) = &bus {
                    bus.publish(
                        SOURCE,
                        EngineEvent::WatchdogTimeout {
                            command_id: session.active_command_id.clone(),
                            reason: TIMEOUT_REASON.to_string(),
                        },
                    );
                }
                on_timeout(session.active_command_id, TIMEOUT_REASON).await;
                return;
            }
        }
    }
}
