//! Automatic dust boot handling around tool changes.
//!
//! After a tool change the dust boot must stay up until the new tool has
//! moved away from the tool setter. The plugin swallows the boot command
//! while the tool change is pending and re-issues it, followed by a short
//! dwell, right after the first XY move.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use spindle_commands::{LineContext, LineDirective};

use crate::context::PluginContext;
use crate::error::Result;
use crate::plugin::Plugin;
use crate::registry::EventHandler;

pub const PLUGIN_ID: &str = "auto-dust-boot";

/// Tool menu label of the reset action.
pub const RESET_MENU_LABEL: &str = "Reset dust boot";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DustBootSettings {
    /// Word that starts a tool change
    pub tool_change_code: String,
    /// Word that lowers the dust boot
    pub boot_code: String,
    /// Dwell sent after the boot command
    pub dwell: String,
}

impl Default for DustBootSettings {
    fn default() -> Self {
        Self {
            tool_change_code: "M6".to_string(),
            boot_code: "M8".to_string(),
            dwell: "G4 P1".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct DustBootState {
    tool_change: bool,
    boot_deferred: bool,
}

/// Dust boot plugin. State lives in the instance, so two loaded copies never
/// see each other's tool changes.
pub struct AutoDustBoot {
    settings: DustBootSettings,
    state: Arc<Mutex<DustBootState>>,
}

impl AutoDustBoot {
    pub fn new(settings: DustBootSettings) -> Self {
        Self {
            settings,
            state: Arc::new(Mutex::new(DustBootState::default())),
        }
    }

    /// Check if a tool change is waiting for its first XY move.
    pub fn tool_change_pending(&self) -> bool {
        self.state.lock().tool_change
    }
}

impl Default for AutoDustBoot {
    fn default() -> Self {
        Self::new(DustBootSettings::default())
    }
}

/// Letter/number words of a line, e.g. `G1 X10` -> `[('G', 1.0), ('X', 10.0)]`.
fn words(line: &str) -> Vec<(char, f64)> {
    line.split_whitespace()
        .filter_map(|word| {
            let mut chars = word.chars();
            let letter = chars.next()?.to_ascii_uppercase();
            let value = chars.as_str().parse::<f64>().ok()?;
            letter.is_ascii_alphabetic().then_some((letter, value))
        })
        .collect()
}

fn has_word(line: &[(char, f64)], code: &str) -> bool {
    match words(code).first() {
        Some(target) => line.contains(target),
        None => false,
    }
}

fn moves_xy(line: &[(char, f64)]) -> bool {
    line.iter().any(|(letter, _)| *letter == 'X' || *letter == 'Y')
}

fn decide(
    settings: &DustBootSettings,
    state: &mut DustBootState,
    line: &str,
) -> (LineDirective, bool) {
    let parsed = words(line);
    if has_word(&parsed, &settings.tool_change_code) {
        state.tool_change = true;
        state.boot_deferred = false;
        return (LineDirective::keep(), false);
    }
    if !state.tool_change {
        return (LineDirective::keep(), false);
    }
    if has_word(&parsed, &settings.boot_code) {
        state.boot_deferred = true;
        return (LineDirective::skip(), false);
    }
    if moves_xy(&parsed) {
        state.tool_change = false;
        if std::mem::take(&mut state.boot_deferred) {
            let directive = LineDirective::keep()
                .with_inject_after([settings.boot_code.clone(), settings.dwell.clone()]);
            return (directive, true);
        }
    }
    (LineDirective::keep(), false)
}

#[async_trait]
impl Plugin for AutoDustBoot {
    fn id(&self) -> &str {
        PLUGIN_ID
    }

    fn name(&self) -> &str {
        "Auto dust boot"
    }

    async fn on_load(&self, ctx: PluginContext) -> Result<()> {
        ctx.set_settings(json!(self.settings));

        let settings = self.settings.clone();
        let state = self.state.clone();
        let line_ctx = ctx.clone();
        ctx.register_event_handler(EventHandler::before_gcode_line(
            move |line: String, position: LineContext| {
                let (directive, lowered) = decide(&settings, &mut state.lock(), &line);
                if lowered {
                    line_ctx.emit_to_client(
                        "dustBoot",
                        json!({ "lowered": true, "lineNumber": position.line_number }),
                    );
                }
                async move { Ok(directive) }
            },
        ))?;

        let state = self.state.clone();
        ctx.register_event_handler(EventHandler::after_job_end(move |_, _| {
            *state.lock() = DustBootState::default();
            async { Ok(()) }
        }))?;

        let state = self.state.clone();
        let menu_ctx = ctx.clone();
        ctx.register_tool_menu(RESET_MENU_LABEL, move || {
            *state.lock() = DustBootState::default();
            menu_ctx.log("Dust boot state reset");
            async { Ok(()) }
        })?;

        ctx.log("Auto dust boot ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(lines: &[&str]) -> Vec<LineDirective> {
        let settings = DustBootSettings::default();
        let mut state = DustBootState::default();
        lines
            .iter()
            .map(|line| decide(&settings, &mut state, line).0)
            .collect()
    }

    #[test]
    fn test_words_parse_codes() {
        assert_eq!(words("g1 x10 F100"), vec![('G', 1.0), ('X', 10.0), ('F', 100.0)]);
        assert!(has_word(&words("M06 T2"), "M6"));
        assert!(!has_word(&words("M61"), "M6"));
    }

    #[test]
    fn test_boot_deferred_until_first_xy_move() {
        let directives = run(&["G1 X10 F100", "M6", "M8", "G0 Z5", "G1 X20 Y5", "G1 X30"]);
        assert_eq!(directives[0], LineDirective::keep());
        assert_eq!(directives[1], LineDirective::keep());
        assert_eq!(directives[2], LineDirective::skip());
        assert_eq!(directives[3], LineDirective::keep());
        assert_eq!(
            directives[4],
            LineDirective::keep().with_inject_after(["M8", "G4 P1"])
        );
        assert_eq!(directives[5], LineDirective::keep());
    }

    #[test]
    fn test_boot_untouched_without_tool_change() {
        let directives = run(&["M8", "G1 X1"]);
        assert!(directives.iter().all(|d| *d == LineDirective::keep()));
    }

    #[test]
    fn test_tool_change_without_boot_injects_nothing() {
        let directives = run(&["M6", "G1 X1 Y1", "M8"]);
        assert!(directives.iter().all(|d| *d == LineDirective::keep()));
    }
}
