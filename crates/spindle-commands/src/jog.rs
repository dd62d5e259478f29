//! Continuous jogging guarded by the watchdog.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use spindle_core::config::WatchdogConfig;
use spindle_core::{Command, CommandId, EngineEvent, RealtimeCommand};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::session::ProtocolSession;
use crate::watchdog::{JogWatchdog, TimeoutCallback};

/// Prefix of grbl jog commands.
pub const JOG_PREFIX: &str = "$J=";

/// Build a jog command line, adding the `$J=` prefix when missing.
pub fn jog_line(motion: &str) -> String {
    let motion = motion.trim();
    if motion.starts_with(JOG_PREFIX) {
        motion.to_string()
    } else {
        format!("{}{}", JOG_PREFIX, motion)
    }
}

/// Sends jog commands and keeps the watchdog armed while a key is held.
#[derive(Clone)]
pub struct JogController {
    session: ProtocolSession,
    watchdog: JogWatchdog,
    seen_jog_state: Arc<AtomicBool>,
}

impl JogController {
    pub fn new(session: ProtocolSession, config: &WatchdogConfig) -> Self {
        let cancel_session = session.clone();
        let on_timeout: TimeoutCallback = Arc::new(move |command_id: CommandId, reason: &'static str| {
            let session = cancel_session.clone();
            async move {
                if let Err(e) = session.realtime(RealtimeCommand::JogCancel).await {
                    warn!(category = "jog", id = %command_id, reason, error = %e, "Jog cancel failed");
                }
            }
            .boxed()
        });
        let watchdog = JogWatchdog::new(Duration::from_millis(config.timeout_ms), on_timeout)
            .with_bus(session.bus().clone());
        Self {
            session,
            watchdog,
            seen_jog_state: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn watchdog(&self) -> &JogWatchdog {
        &self.watchdog
    }

    /// Start a continuous jog, e.g. `G91 X10 F1000`. Returns the command ID
    /// the watchdog tracks.
    pub async fn jog(&self, motion: &str) -> Result<CommandId, SessionError> {
        let command = Command::system(jog_line(motion));
        let command_id = command.id.clone();
        self.seen_jog_state.store(false, Ordering::SeqCst);
        self.watchdog.start(command_id.clone());

        match self.session.write(command).await {
            Ok(_) => {
                info!(category = "jog", id = %command_id, motion, "Jog started");
                Ok(command_id)
            }
            Err(e) => {
                self.watchdog.clear();
                Err(e)
            }
        }
    }

    /// Keep the current jog alive. Returns `false` when no jog is armed.
    pub fn heartbeat(&self) -> bool {
        self.watchdog.extend()
    }

    /// Cancel the jog now.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.watchdog.clear();
        self.session.realtime(RealtimeCommand::JogCancel).await
    }

    /// Clear the watchdog once status reports show the controller left `Jog`.
    pub fn spawn_status_monitor(&self) -> JoinHandle<()> {
        let controller = self.clone();
        let mut events = self.session.bus().subscribe();
        tokio::spawn(async move {
            while let Some((event, _)) = events.recv().await {
                if let EngineEvent::StatusReport { report } = event {
                    controller.observe_state(report.state_name());
                }
            }
        })
    }

    fn observe_state(&self, state: &str) {
        if !self.watchdog.is_armed() {
            return;
        }
        if state == "Jog" {
            self.seen_jog_state.store(true, Ordering::SeqCst);
        } else if self.seen_jog_state.swap(false, Ordering::SeqCst) {
            info!(category = "jog", state, "Jog finished");
            self.watchdog.clear();
        }
    }
}
