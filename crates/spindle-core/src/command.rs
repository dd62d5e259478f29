//! Command data structures.
//!
//! Defines the commands the engine writes to a controller and the
//! acknowledgements the controller returns for them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique command identifier.
pub type CommandId = String;

/// Single-byte real-time commands.
///
/// The controller handles these out-of-band, ahead of anything sitting in its
/// receive buffer, so they are never acknowledged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeCommand {
    /// `?` status report query
    StatusQuery,
    /// `!` feed hold
    FeedHold,
    /// `~` cycle start / resume
    CycleStart,
    /// Ctrl-X soft reset, flushes the controller buffers
    SoftReset,
    /// Safety door
    SafetyDoor,
    /// Cancel the active jog motion
    JogCancel,
    /// Reset feed override to 100%
    FeedOverrideReset,
    /// Reset rapid override to 100%
    RapidOverrideReset,
    /// Reset spindle override to 100%
    SpindleOverrideReset,
}

impl RealtimeCommand {
    /// The byte written to the wire.
    pub fn byte(&self) -> u8 {
        match self {
            RealtimeCommand::StatusQuery => b'?',
            RealtimeCommand::FeedHold => b'!',
            RealtimeCommand::CycleStart => b'~',
            RealtimeCommand::SoftReset => 0x18,
            RealtimeCommand::SafetyDoor => 0x84,
            RealtimeCommand::JogCancel => 0x85,
            RealtimeCommand::FeedOverrideReset => 0x90,
            RealtimeCommand::RapidOverrideReset => 0x95,
            RealtimeCommand::SpindleOverrideReset => 0x99,
        }
    }

    /// Get the command name.
    pub fn name(&self) -> &'static str {
        match self {
            RealtimeCommand::StatusQuery => "status-query",
            RealtimeCommand::FeedHold => "feed-hold",
            RealtimeCommand::CycleStart => "cycle-start",
            RealtimeCommand::SoftReset => "soft-reset",
            RealtimeCommand::SafetyDoor => "safety-door",
            RealtimeCommand::JogCancel => "jog-cancel",
            RealtimeCommand::FeedOverrideReset => "feed-override-reset",
            RealtimeCommand::RapidOverrideReset => "rapid-override-reset",
            RealtimeCommand::SpindleOverrideReset => "spindle-override-reset",
        }
    }
}

impl std::fmt::Display for RealtimeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Command category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// A G-code program line
    Gcode,
    /// A real-time control byte
    Realtime(RealtimeCommand),
    /// A `$`-prefixed system command (settings, jog, alarm catalog, ...)
    System,
}

impl CommandKind {
    /// Get the kind name.
    pub fn type_name(&self) -> &'static str {
        match self {
            CommandKind::Gcode => "gcode",
            CommandKind::Realtime(_) => "realtime",
            CommandKind::System => "system",
        }
    }
}

/// A command on its way to the controller.
///
/// Commands are immutable once enqueued; the builder methods are meant to be
/// used before handing the command over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Command ID
    pub id: CommandId,
    /// Command text without line terminator
    pub text: String,
    /// Command kind
    pub kind: CommandKind,
    /// Free-form metadata supplied by the caller
    #[serde(default)]
    pub meta: HashMap<String, serde_json::Value>,
    /// When the command was created
    pub enqueued_at: DateTime<Utc>,
}

impl Command {
    /// Create a new command of the given kind.
    pub fn new(kind: CommandKind, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            kind,
            meta: HashMap::new(),
            enqueued_at: Utc::now(),
        }
    }

    /// Create a G-code line command. Lines starting with `$` become system commands.
    pub fn gcode(text: impl Into<String>) -> Self {
        let text = text.into();
        let kind = if text.trim_start().starts_with('$') {
            CommandKind::System
        } else {
            CommandKind::Gcode
        };
        Self::new(kind, text)
    }

    /// Create a system command.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(CommandKind::System, text)
    }

    /// Create a real-time command.
    pub fn realtime(command: RealtimeCommand) -> Self {
        Self::new(CommandKind::Realtime(command), command.name())
    }

    /// Attach a metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Merge a metadata map.
    pub fn with_meta_map(mut self, meta: HashMap<String, serde_json::Value>) -> Self {
        self.meta.extend(meta);
        self
    }

    /// Check if this is a real-time command.
    pub fn is_realtime(&self) -> bool {
        matches!(self.kind, CommandKind::Realtime(_))
    }

    /// Number of bytes this command occupies in the controller receive buffer,
    /// terminator included.
    pub fn wire_len(&self, terminator: &str) -> usize {
        match self.kind {
            CommandKind::Realtime(_) => 0,
            _ => self.text.len() + terminator.len(),
        }
    }

    /// Serialize the command for the wire.
    pub fn to_wire(&self, terminator: &str) -> Vec<u8> {
        match self.kind {
            CommandKind::Realtime(rt) => vec![rt.byte()],
            _ => {
                let mut bytes = Vec::with_capacity(self.text.len() + terminator.len());
                bytes.extend_from_slice(self.text.as_bytes());
                bytes.extend_from_slice(terminator.as_bytes());
                bytes
            }
        }
    }
}

/// Controller response to a written line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", content = "code", rename_all = "lowercase")]
pub enum AckResponse {
    /// `ok`
    Ok,
    /// `error:<code>`
    Error(u16),
}

impl AckResponse {
    /// Check if the response is a success.
    pub fn is_ok(&self) -> bool {
        matches!(self, AckResponse::Ok)
    }
}

/// Acknowledgement pairing one written command with its response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    /// The acknowledged command
    pub command_id: CommandId,
    /// The command text as written
    pub text: String,
    /// Controller response
    pub response: AckResponse,
    /// When the response arrived
    pub received_at: DateTime<Utc>,
}

impl Ack {
    /// Create an acknowledgement for a command.
    pub fn new(command: &Command, response: AckResponse) -> Self {
        Self {
            command_id: command.id.clone(),
            text: command.text.clone(),
            response,
            received_at: Utc::now(),
        }
    }

    /// Check if the controller accepted the command.
    pub fn is_ok(&self) -> bool {
        self.response.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gcode_vs_system_kind() {
        assert_eq!(Command::gcode("G1 X10").kind, CommandKind::Gcode);
        assert_eq!(Command::gcode("$H").kind, CommandKind::System);
        assert_eq!(Command::gcode("  $J=G91 X1 F100").kind, CommandKind::System);
    }

    #[test]
    fn test_wire_encoding() {
        let cmd = Command::gcode("G0 X1");
        assert_eq!(cmd.to_wire("\n"), b"G0 X1\n".to_vec());
        assert_eq!(cmd.wire_len("\n"), 6);

        let rt = Command::realtime(RealtimeCommand::JogCancel);
        assert_eq!(rt.to_wire("\n"), vec![0x85]);
        assert_eq!(rt.wire_len("\n"), 0);
        assert!(rt.is_realtime());
    }

    #[test]
    fn test_unique_ids() {
        let a = Command::gcode("G0");
        let b = Command::gcode("G0");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_ack_response_serde() {
        let json = serde_json::to_value(AckResponse::Error(20)).unwrap();
        assert_eq!(json, serde_json::json!({"status": "error", "code": 20}));
        let ok: AckResponse = serde_json::from_value(serde_json::json!({"status": "ok"})).unwrap();
        assert!(ok.is_ok());
    }
}
