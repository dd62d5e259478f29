//! Line protocol: byte reassembly and line classification.

use spindle_core::RawStatusReport;

/// Reassembles transport bytes into lines.
///
/// Splits on `\n`, drops a trailing `\r`, and holds partial lines until
/// their terminator arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every line they completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                let raw = std::mem::take(&mut self.pending);
                let line = String::from_utf8_lossy(&raw);
                lines.push(line.trim_end_matches('\r').to_string());
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Bytes of the current partial line.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// A classified controller line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerLine {
    /// `ok`
    Ok,
    /// `error:<code>`
    Error(u16),
    /// `ALARM:<code>`
    Alarm(u16),
    /// `<...>` status report
    Status(RawStatusReport),
    /// `Grbl ...` / `GrblHAL ...` startup banner
    Welcome(String),
    /// Bracketed feedback (`[MSG:..]`, `[ALARMCODE:..]`, `[GC:..]`) and `$` settings
    System(String),
    /// Recognized shape, unusable content
    Malformed { line: String, reason: String },
    /// Anything else
    Unmatched(String),
}

/// Classify one received line. Blank lines yield `None`.
pub fn classify(raw: &str) -> Option<ControllerLine> {
    let line = raw.trim();
    if line.is_empty() {
        return None;
    }

    if line.eq_ignore_ascii_case("ok") {
        return Some(ControllerLine::Ok);
    }
    if let Some(code) = strip_prefix_ignore_case(line, "error:") {
        return Some(ControllerLine::Error(parse_code(code)));
    }
    if let Some(code) = strip_prefix_ignore_case(line, "ALARM:") {
        return Some(ControllerLine::Alarm(parse_code(code)));
    }
    if line.starts_with('<') {
        return Some(match RawStatusReport::parse(line) {
            Some(report) if line.ends_with('>') => ControllerLine::Status(report),
            _ => ControllerLine::Malformed {
                line: line.to_string(),
                reason: "unparseable status report".to_string(),
            },
        });
    }
    if line.starts_with("Grbl ") || line.starts_with("GrblHAL ") {
        return Some(ControllerLine::Welcome(line.to_string()));
    }
    if (line.starts_with('[') && line.ends_with(']')) || (line.starts_with('$') && line.contains('='))
    {
        return Some(ControllerLine::System(line.to_string()));
    }
    Some(ControllerLine::Unmatched(line.to_string()))
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &line[prefix.len()..])
}

/// Non-numeric codes map to 0.
fn parse_code(code: &str) -> u16 {
    code.trim().parse().unwrap_or(0)
}
