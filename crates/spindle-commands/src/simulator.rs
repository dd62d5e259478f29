//! Simulated grbl controller.
//!
//! Answers every line immediately, tracks a rough machine position and state,
//! and replies to real-time bytes. Used by the CLI `simulate` command and by
//! tests that need a controller that talks back.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use spindle_core::alarms::fallback_alarm;
use spindle_core::{RealtimeCommand, TransportError};

use crate::transport::{MemoryTransport, PortEnumerator, PortInfo, Transport, TransportEvents};

/// Port name served by [`SimulatorPorts`].
pub const SIMULATOR_PORT: &str = "sim://grbl";

/// Startup banner printed on open and after a soft reset.
pub const BANNER: &str = "Grbl 1.1h ['$' for help]";

struct MachineState {
    status: String,
    position: [f64; 3],
    feed: f64,
    absolute: bool,
    errors: HashMap<String, u16>,
}

impl Default for MachineState {
    fn default() -> Self {
        Self {
            status: "Idle".to_string(),
            position: [0.0; 3],
            feed: 0.0,
            absolute: true,
            errors: HashMap::new(),
        }
    }
}

/// In-process controller behind the [`Transport`] seam.
pub struct SimulatedController {
    link: Arc<MemoryTransport>,
    machine: Mutex<MachineState>,
}

impl SimulatedController {
    pub fn new() -> (Arc<Self>, TransportEvents) {
        let (link, events) = MemoryTransport::new();
        let controller = Arc::new(Self {
            link,
            machine: Mutex::new(MachineState::default()),
        });
        (controller, events)
    }

    /// The recording link underneath.
    pub fn link(&self) -> &MemoryTransport {
        &self.link
    }

    /// Answer `line` with `error:code` instead of `ok`.
    pub fn fail_line(&self, line: impl Into<String>, code: u16) {
        self.machine.lock().errors.insert(line.into(), code);
    }

    /// Print the startup banner.
    pub fn boot(&self) {
        self.link.push_line(BANNER);
    }

    /// Current machine position.
    pub fn position(&self) -> [f64; 3] {
        self.machine.lock().position
    }

    /// Current controller state name.
    pub fn status(&self) -> String {
        self.machine.lock().status.clone()
    }

    /// Current status report line.
    pub fn status_report(&self) -> String {
        let machine = self.machine.lock();
        let [x, y, z] = machine.position;
        format!(
            "<{}|MPos:{:.3},{:.3},{:.3}|Bf:15,127|FS:{},0|Ov:100,100,100>",
            machine.status, x, y, z, machine.feed
        )
    }

    fn respond(&self, bytes: &[u8]) {
        if let [byte] = bytes {
            if *byte != b'\n' {
                self.respond_realtime(*byte);
                return;
            }
        }
        let text = String::from_utf8_lossy(bytes);
        let line = text.trim();
        if line.is_empty() {
            return;
        }
        for reply in self.execute(line) {
            self.link.push_line(&reply);
        }
    }

    fn respond_realtime(&self, byte: u8) {
        let status_query = RealtimeCommand::StatusQuery.byte();
        let feed_hold = RealtimeCommand::FeedHold.byte();
        let cycle_start = RealtimeCommand::CycleStart.byte();
        let soft_reset = RealtimeCommand::SoftReset.byte();
        let jog_cancel = RealtimeCommand::JogCancel.byte();

        if byte == status_query {
            let report = self.status_report();
            self.link.push_line(&report);
        } else if byte == feed_hold {
            self.machine.lock().status = "Hold:0".to_string();
        } else if byte == cycle_start {
            self.machine.lock().status = "Idle".to_string();
        } else if byte == soft_reset {
            self.machine.lock().status = "Idle".to_string();
            self.boot();
        } else if byte == jog_cancel {
            let mut machine = self.machine.lock();
            if machine.status == "Jog" {
                machine.status = "Idle".to_string();
            }
        }
    }

    fn execute(&self, line: &str) -> Vec<String> {
        let mut machine = self.machine.lock();
        if let Some(code) = machine.errors.get(line) {
            return vec![format!("error:{}", code)];
        }

        let upper = line.to_ascii_uppercase();
        if upper == "$EA" {
            let mut replies: Vec<String> = (1..=10)
                .filter_map(|code| fallback_alarm(code).map(|text| format!("[ALARMCODE:{}||{}]", code, text)))
                .collect();
            replies.push("ok".to_string());
            return replies;
        }
        if upper == "$X" {
            machine.status = "Idle".to_string();
            return vec!["[MSG:Caution: Unlocked]".to_string(), "ok".to_string()];
        }
        if upper == "$H" {
            machine.position = [0.0; 3];
            machine.status = "Idle".to_string();
            return vec!["ok".to_string()];
        }
        if let Some(motion) = upper.strip_prefix("$J=") {
            let relative = motion.contains("G91");
            apply_words(&mut machine, motion, !relative);
            machine.status = "Jog".to_string();
            return vec!["ok".to_string()];
        }
        if upper.starts_with('$') {
            return vec!["ok".to_string()];
        }

        let absolute = machine.absolute;
        apply_words(&mut machine, &upper, absolute);
        vec!["ok".to_string()]
    }
}

/// Apply G90/G91, F and axis words of one line.
fn apply_words(machine: &mut MachineState, line: &str, absolute: bool) {
    let mut absolute = absolute;
    let mut target = machine.position;
    let mut moved = false;
    for word in line.split_whitespace() {
        let mut chars = word.chars();
        let Some(letter) = chars.next() else {
            continue;
        };
        let Ok(value) = chars.as_str().parse::<f64>() else {
            continue;
        };
        match letter {
            'G' if value == 90.0 => {
                absolute = true;
                machine.absolute = true;
            }
            'G' if value == 91.0 => {
                absolute = false;
                machine.absolute = false;
            }
            'F' => machine.feed = value,
            'X' | 'Y' | 'Z' => {
                let axis = match letter {
                    'X' => 0,
                    'Y' => 1,
                    _ => 2,
                };
                target[axis] = if absolute {
                    value
                } else {
                    machine.position[axis] + value
                };
                moved = true;
            }
            _ => {}
        }
    }
    if moved {
        machine.position = target;
    }
}

#[async_trait]
impl Transport for SimulatedController {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.link.write(bytes).await?;
        self.respond(bytes);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.link.is_open()
    }
}

/// Port enumerator serving one simulated controller port.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatorPorts;

#[async_trait]
impl PortEnumerator for SimulatorPorts {
    async fn list_ports(&self) -> Result<Vec<PortInfo>, TransportError> {
        Ok(vec![PortInfo {
            path: SIMULATOR_PORT.to_string(),
            manufacturer: Some("spindle".to_string()),
        }])
    }

    async fn open(
        &self,
        port: &str,
        _baud: u32,
    ) -> Result<(Arc<dyn Transport>, TransportEvents), TransportError> {
        if port != SIMULATOR_PORT {
            return Err(TransportError::PortNotFound(port.to_string()));
        }
        let (controller, events) = SimulatedController::new();
        controller.boot();
        let transport: Arc<dyn Transport> = controller;
        Ok((transport, events))
    }
}
