//! Alarm catalog and controller code descriptions.
//!
//! The catalog is filled once from the controller (`$EA` on grblHAL) and is
//! append-only afterwards. When it lacks a code, the built-in GRBL tables are
//! used as a fallback.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Description used when neither the catalog nor the fallback table knows a code.
pub const UNKNOWN_ALARM: &str = "Unknown alarm";

/// Description used for unknown error codes.
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Read-only alarm lookup collaborator.
pub trait AlarmLookup: Send + Sync {
    /// Get the description for an alarm code.
    fn get(&self, code: u16) -> Option<String>;
}

/// Append-only map of alarm codes to descriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlarmCatalog {
    entries: HashMap<u16, String>,
}

impl AlarmCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a description. Existing entries are never overwritten.
    ///
    /// Returns `true` if the entry was added.
    pub fn insert(&mut self, code: u16, description: impl Into<String>) -> bool {
        if self.entries.contains_key(&code) {
            return false;
        }
        self.entries.insert(code, description.into());
        true
    }

    /// Add every `[ALARMCODE:n||text]` line from a controller response.
    ///
    /// Returns the number of entries added.
    pub fn extend_from_lines<'a>(&mut self, lines: impl IntoIterator<Item = &'a str>) -> usize {
        lines
            .into_iter()
            .filter_map(parse_alarm_code_line)
            .filter(|(code, text)| self.insert(*code, text.clone()))
            .count()
    }

    /// Number of catalogued codes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries sorted by code.
    pub fn sorted(&self) -> Vec<(u16, &str)> {
        let mut entries: Vec<_> = self.entries.iter().map(|(k, v)| (*k, v.as_str())).collect();
        entries.sort_by_key(|(code, _)| *code);
        entries
    }
}

impl AlarmLookup for AlarmCatalog {
    fn get(&self, code: u16) -> Option<String> {
        self.entries.get(&code).cloned()
    }
}

/// Parse a `[ALARMCODE:n|<unused>|text]` controller line.
pub fn parse_alarm_code_line(line: &str) -> Option<(u16, String)> {
    let body = line
        .trim()
        .strip_prefix("[ALARMCODE:")?
        .strip_suffix(']')?;
    let mut parts = body.splitn(3, '|');
    let code = parts.next()?.trim().parse::<u16>().ok()?;
    let _ = parts.next()?;
    let text = parts.next()?.trim();
    Some((code, text.to_string()))
}

/// Resolve an alarm description: catalog first, then the fallback table.
pub fn describe_alarm(lookup: Option<&dyn AlarmLookup>, code: u16) -> String {
    lookup
        .and_then(|catalog| catalog.get(code))
        .or_else(|| fallback_alarm(code).map(str::to_string))
        .unwrap_or_else(|| UNKNOWN_ALARM.to_string())
}

/// Built-in GRBL/grblHAL alarm descriptions.
pub fn fallback_alarm(code: u16) -> Option<&'static str> {
    let text = match code {
        1 => "Hard limit triggered. Machine position is likely lost; re-homing is recommended.",
        2 => "Motion target exceeds machine travel. Machine position safely retained.",
        3 => "Reset while in motion. Position cannot be guaranteed; re-homing is recommended.",
        4 => "Probe fail. Probe is not in the expected initial state before starting the cycle.",
        5 => "Probe fail. Probe did not contact the workpiece within the programmed travel.",
        6 => "Homing fail. Reset during active homing cycle.",
        7 => "Homing fail. Safety door was opened during active homing cycle.",
        8 => "Homing fail. Cycle failed to clear limit switch when pulling off.",
        9 => "Homing fail. Could not find limit switch within search distance.",
        10 => "E-stop asserted. Clear and reset.",
        11 => "Homing required. Execute homing command ($H) to continue.",
        12 => "Limit switch engaged. Clear before continuing.",
        13 => "Probe protection triggered. Clear before continuing.",
        14 => "Spindle at speed timeout. Clear before continuing.",
        15 => "Homing fail. Could not find second limit switch for auto squared axis.",
        16 => "Power on selftest (POS) failed.",
        17 => "Motor fault.",
        _ => return None,
    };
    Some(text)
}

/// Built-in GRBL error code descriptions.
pub fn describe_error(code: u16) -> &'static str {
    match code {
        1 => "G-code words consist of a letter and a value. Letter was not found.",
        2 => "Numeric value format is not valid or missing an expected value.",
        3 => "'$' system command was not recognized or supported.",
        4 => "Negative value received for an expected positive value.",
        5 => "Homing cycle is not enabled via settings.",
        6 => "Minimum step pulse time must be greater than 3usec.",
        7 => "EEPROM read failed. Reset and restored to default values.",
        8 => "'$' command cannot be used unless the controller is IDLE.",
        9 => "G-code locked out during alarm or jog state.",
        10 => "Soft limits cannot be enabled without homing also enabled.",
        11 => "Max characters per line exceeded. Line was not processed.",
        12 => "'$' setting value exceeds the maximum step rate supported.",
        13 => "Safety door detected as opened and door state initiated.",
        14 => "Build info or startup line exceeded EEPROM line length limit.",
        15 => "Jog target exceeds machine travel. Command ignored.",
        16 => "Jog command with no '=' or contains prohibited g-code.",
        17 => "Laser mode requires PWM output.",
        20 => "Unsupported or invalid g-code command found in block.",
        21 => "More than one g-code command from same modal group found in block.",
        22 => "Feed rate has not yet been set or is undefined.",
        23 => "G-code command in block requires an integer value.",
        24 => "Two G-code commands that both require XYZ axis words were detected in the block.",
        25 => "A G-code word was repeated in the block.",
        26 => "A G-code command requires XYZ axis words in the block, but none were detected.",
        27 => "N line number value is not within the valid range of 1 - 9,999,999.",
        28 => "A G-code command is missing some required P or L value words.",
        29 => "Unsupported work coordinate system. Only G54-G59 are supported.",
        30 => "G53 requires either a G0 seek or G1 feed motion mode to be active.",
        31 => "There are unused axis words in the block and G80 motion mode cancel is active.",
        32 => "A G2 or G3 arc was commanded but there are no XYZ axis words in the selected plane.",
        33 => "The motion command has an invalid target.",
        34 => "A G2 or G3 arc, traced with the radius definition, had a mathematical error.",
        35 => "A G2 or G3 arc, traced with the offset definition, is missing the IJK offset word.",
        36 => "There are unused, leftover G-code words that aren't used by any command in the block.",
        37 => "G43.1 dynamic tool length offset cannot apply an offset to an unconfigured axis.",
        38 => "Tool number greater than max supported value.",
        _ => UNKNOWN_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_alarm_code_line() {
        assert_eq!(
            parse_alarm_code_line("[ALARMCODE:1||Hard limit has been triggered.]"),
            Some((1, "Hard limit has been triggered.".to_string()))
        );
        assert_eq!(
            parse_alarm_code_line("[ALARMCODE:12|x|Limit | switch]"),
            Some((12, "Limit | switch".to_string()))
        );
        assert_eq!(parse_alarm_code_line("[MSG:Caution: Unlocked]"), None);
        assert_eq!(parse_alarm_code_line("[ALARMCODE:abc||text]"), None);
    }

    #[test]
    fn test_catalog_is_append_only() {
        let mut catalog = AlarmCatalog::new();
        assert!(catalog.insert(1, "first"));
        assert!(!catalog.insert(1, "second"));
        assert_eq!(catalog.get(1).as_deref(), Some("first"));
    }

    #[test]
    fn test_extend_from_lines() {
        let mut catalog = AlarmCatalog::new();
        let added = catalog.extend_from_lines([
            "[ALARMCODE:1||Hard limit]",
            "[ALARMCODE:2||Soft limit]",
            "ok",
            "[ALARMCODE:1||Duplicate]",
        ]);
        assert_eq!(added, 2);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.sorted()[1], (2, "Soft limit"));
    }

    #[test]
    fn test_describe_alarm_falls_back() {
        let mut catalog = AlarmCatalog::new();
        catalog.insert(1, "Custom hard limit text");
        let lookup: &dyn AlarmLookup = &catalog;

        assert_eq!(describe_alarm(Some(lookup), 1), "Custom hard limit text");
        assert!(describe_alarm(Some(lookup), 2).starts_with("Motion target"));
        assert!(describe_alarm(None, 9).starts_with("Homing fail"));
        assert_eq!(describe_alarm(Some(lookup), 250), UNKNOWN_ALARM);
    }

    #[test]
    fn test_describe_error() {
        assert!(describe_error(22).contains("Feed rate"));
        assert_eq!(describe_error(999), UNKNOWN_ERROR);
    }
}
