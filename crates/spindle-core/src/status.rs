//! Raw controller status reports.

use serde::{Deserialize, Serialize};

/// A `<State|Field:value|...>` status report split into raw fields.
///
/// Field names and value formats vary between firmware builds; the telemetry
/// normalizer turns this into the canonical snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStatusReport {
    /// Controller state, e.g. `Idle`, `Run`, `Hold:0`, `Jog`, `Alarm`
    pub state: String,
    /// `(name, value)` pairs in report order
    pub fields: Vec<(String, String)>,
}

impl RawStatusReport {
    /// Parse the body of a status report line, with or without the angle brackets.
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        let body = trimmed
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .unwrap_or(trimmed);
        let mut parts = body.split('|');
        let state = parts.next()?.trim();
        if state.is_empty() {
            return None;
        }
        let fields = parts
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once(':') {
                Some((name, value)) => (name.to_string(), value.to_string()),
                None => (part.to_string(), String::new()),
            })
            .collect();
        Some(Self {
            state: state.to_string(),
            fields,
        })
    }

    /// Get a raw field value by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// The state name without its sub-state (`Hold:0` -> `Hold`).
    pub fn state_name(&self) -> &str {
        self.state.split(':').next().unwrap_or(&self.state)
    }
}
