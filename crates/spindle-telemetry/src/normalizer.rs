//! Status report normalization.
//!
//! Controllers report the same quantities under different field names and
//! layouts (`FS:` vs `F:`, `Bf:` vs `Buf:`/`RX:`, `MPos:` vs `WPos:`). The
//! normalizer maps them onto one canonical snapshot. Fields that are missing
//! or unparsable are left out.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use spindle_core::RawStatusReport;

use crate::diff::StateMap;

/// Per-axis values, `x`/`y`/`z` always present, rotary axes when reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisValues {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c: Option<f64>,
}

impl AxisValues {
    /// Parse a comma separated coordinate list, e.g. `1.000,2.000,3.000`.
    pub fn parse(value: &str) -> Option<Self> {
        let values = value
            .split(',')
            .map(|v| v.trim().parse::<f64>().ok())
            .collect::<Option<Vec<f64>>>()?;
        Self::from_values(&values)
    }

    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.len() < 3 {
            return None;
        }
        Some(Self {
            x: values[0],
            y: values[1],
            z: values[2],
            a: values.get(3).copied(),
            b: values.get(4).copied(),
            c: values.get(5).copied(),
        })
    }

    pub fn values(&self) -> Vec<f64> {
        let mut values = vec![self.x, self.y, self.z];
        values.extend([self.a, self.b, self.c].into_iter().map_while(|v| v));
        values
    }

    /// Element-wise combination over the axes both sides report.
    fn zip_with(&self, other: &AxisValues, f: impl Fn(f64, f64) -> f64) -> Option<Self> {
        let values: Vec<f64> = self
            .values()
            .into_iter()
            .zip(other.values())
            .map(|(a, b)| round3(f(a, b)))
            .collect();
        Self::from_values(&values)
    }
}

/// Round to the controller's reporting resolution so derived positions do
/// not flicker in diffs.
fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Controller state with optional sub-state (`Hold:1`, `Door:0`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerState {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_state: Option<u32>,
}

/// Planner and serial receive buffer availability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerBufferState {
    pub blocks_available: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rx_bytes_available: Option<u32>,
}

/// Canonical machine state derived from one status report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_state: Option<ControllerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_position: Option<AxisValues>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_position: Option<AxisValues>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_coordinate_offset: Option<AxisValues>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spindle_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_override_pct: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rapid_override_pct: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spindle_override_pct: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planner_buffer_state: Option<PlannerBufferState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pins: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u64>,
}

impl TelemetrySnapshot {
    /// The snapshot as a key/value map for diffing.
    pub fn to_map(&self) -> StateMap {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => StateMap::new(),
        }
    }
}

fn parse_u32_list(value: &str) -> Vec<Option<u32>> {
    value
        .split(',')
        .map(|v| v.trim().parse::<f64>().ok().map(|n| n as u32))
        .collect()
}

fn parse_f64_list(value: &str) -> Vec<Option<f64>> {
    value.split(',').map(|v| v.trim().parse::<f64>().ok()).collect()
}

/// Turns raw status reports into snapshots.
///
/// Keeps the last reported work coordinate offset, since controllers only
/// include `WCO:` every few reports.
#[derive(Debug, Default)]
pub struct TelemetryNormalizer {
    last_wco: Option<AxisValues>,
}

impl TelemetryNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the remembered offset, e.g. after a controller reset.
    pub fn reset(&mut self) {
        self.last_wco = None;
    }

    pub fn normalize(&mut self, report: &RawStatusReport) -> TelemetrySnapshot {
        let mut snapshot = TelemetrySnapshot {
            controller_state: Some(controller_state(&report.state)),
            ..TelemetrySnapshot::default()
        };

        let mut machine = None;
        let mut work = None;
        let mut rx_bytes = None;

        for (name, value) in &report.fields {
            match name.as_str() {
                "MPos" => machine = AxisValues::parse(value),
                "WPos" => work = AxisValues::parse(value),
                "WCO" => {
                    if let Some(wco) = AxisValues::parse(value) {
                        self.last_wco = Some(wco);
                    }
                }
                "FS" => {
                    let parts = parse_f64_list(value);
                    snapshot.feed = parts.first().copied().flatten();
                    snapshot.spindle_speed = parts.get(1).copied().flatten();
                }
                "F" => snapshot.feed = value.trim().parse().ok(),
                "Ov" => {
                    let parts = parse_u32_list(value);
                    snapshot.feed_override_pct = parts.first().copied().flatten();
                    snapshot.rapid_override_pct = parts.get(1).copied().flatten();
                    snapshot.spindle_override_pct = parts.get(2).copied().flatten();
                }
                "Bf" => {
                    let parts = parse_u32_list(value);
                    if let Some(blocks) = parts.first().copied().flatten() {
                        snapshot.planner_buffer_state = Some(PlannerBufferState {
                            blocks_available: blocks,
                            rx_bytes_available: parts.get(1).copied().flatten(),
                        });
                    }
                }
                "Buf" => {
                    if let Ok(blocks) = value.trim().parse() {
                        snapshot.planner_buffer_state = Some(PlannerBufferState {
                            blocks_available: blocks,
                            rx_bytes_available: None,
                        });
                    }
                }
                "RX" => rx_bytes = value.trim().parse().ok(),
                "Pn" if !value.is_empty() => snapshot.pins = Some(value.clone()),
                "Ln" => snapshot.line_number = value.trim().parse().ok(),
                _ => {}
            }
        }

        if let (Some(buffer), Some(rx)) = (snapshot.planner_buffer_state.as_mut(), rx_bytes) {
            buffer.rx_bytes_available.get_or_insert(rx);
        }

        if let Some(wco) = &self.last_wco {
            if work.is_none() {
                work = machine.as_ref().and_then(|m| m.zip_with(wco, |m, o| m - o));
            }
            if machine.is_none() {
                machine = work.as_ref().and_then(|w| w.zip_with(wco, |w, o| w + o));
            }
        }

        snapshot.machine_position = machine;
        snapshot.work_position = work;
        snapshot.work_coordinate_offset = self.last_wco.clone();
        snapshot
    }
}

fn controller_state(raw: &str) -> ControllerState {
    match raw.split_once(':') {
        Some((state, sub)) => ControllerState {
            state: state.to_string(),
            sub_state: sub.trim().parse().ok(),
        },
        None => ControllerState {
            state: raw.to_string(),
            sub_state: None,
        },
    }
}
