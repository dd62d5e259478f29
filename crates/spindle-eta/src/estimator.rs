//! Motion-time estimation.
//!
//! Walks a program with the modal state that affects timing (motion mode,
//! plane, units, distance mode, feed) and prices each move with a
//! trapezoidal velocity profile. Results are advisory only.

use std::f64::consts::TAU;

use serde::Serialize;
use tracing::debug;

use crate::limits::{AxisGroup, MachineLimits};
use crate::words::{scan, Word};

const MM_PER_INCH: f64 = 25.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Motion {
    Rapid,
    Linear,
    ArcCw,
    ArcCcw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plane {
    Xy,
    Zx,
    Yz,
}

/// Streaming estimator holding the modal state between lines.
#[derive(Debug, Clone)]
pub struct Estimator {
    limits: MachineLimits,
    position: [f64; 3],
    motion: Option<Motion>,
    plane: Plane,
    absolute: bool,
    inches: bool,
    /// Feed in mm/min
    feed: Option<f64>,
}

impl Estimator {
    pub fn new(limits: MachineLimits) -> Self {
        Self {
            limits,
            position: [0.0; 3],
            motion: None,
            plane: Plane::Xy,
            absolute: true,
            inches: false,
            feed: None,
        }
    }

    /// Current position in mm.
    pub fn position(&self) -> [f64; 3] {
        self.position
    }

    /// Estimated seconds for one line; updates the modal state.
    pub fn line(&mut self, line: &str) -> f64 {
        let words = scan(line);
        if words.is_empty() {
            return 0.0;
        }

        let mut target_words: [Option<f64>; 3] = [None; 3];
        let mut offsets: [Option<f64>; 2] = [None; 2];
        let mut radius = None;
        let mut non_modal = false;

        for &Word { letter, value } in &words {
            match letter {
                b'G' => self.apply_g(value, &mut non_modal),
                b'F' => {
                    let scale = if self.inches { MM_PER_INCH } else { 1.0 };
                    self.feed = Some(value * scale);
                }
                b'X' => target_words[0] = Some(value),
                b'Y' => target_words[1] = Some(value),
                b'Z' => target_words[2] = Some(value),
                b'I' => offsets[0] = Some(value),
                b'J' => offsets[1] = Some(value),
                b'R' => radius = Some(value),
                _ => {}
            }
        }

        if non_modal || target_words.iter().all(Option::is_none) {
            return 0.0;
        }
        let Some(motion) = self.motion else {
            return 0.0;
        };

        let scale = if self.inches { MM_PER_INCH } else { 1.0 };
        let start = self.position;
        let mut target = start;
        for (axis, word) in target_words.iter().enumerate() {
            if let Some(value) = word {
                target[axis] = if self.absolute {
                    value * scale
                } else {
                    start[axis] + value * scale
                };
            }
        }
        self.position = target;

        let delta = [target[0] - start[0], target[1] - start[1], target[2] - start[2]];
        let distance = match motion {
            Motion::Rapid | Motion::Linear => norm(&delta),
            Motion::ArcCw | Motion::ArcCcw if self.plane == Plane::Xy => {
                let offsets = offsets.map(|o| o.map(|v| v * scale));
                let radius = radius.map(|r| r * scale);
                arc_length_xy(start, target, offsets, radius, motion == Motion::ArcCw)
            }
            // Chord length outside the XY plane.
            Motion::ArcCw | Motion::ArcCcw => norm(&delta),
        };
        if distance <= 0.0 {
            return 0.0;
        }

        let group = if delta[2].abs() > delta[0].hypot(delta[1]) {
            AxisGroup::Z
        } else {
            AxisGroup::Xy
        };
        let max_rate = self.limits.rate_mm_s(group);
        let requested = match motion {
            Motion::Rapid => max_rate,
            _ => match self.feed {
                Some(feed) => feed / 60.0,
                None => return 0.0,
            },
        };
        let velocity = if max_rate > 0.0 {
            requested.min(max_rate)
        } else {
            requested
        };
        move_time(distance, velocity, self.limits.acceleration(group))
    }

    /// Apply one G word. Codes are compared in tenths so `G91.1` or `G38.2`
    /// never alias an integer code.
    fn apply_g(&mut self, code: f64, non_modal: &mut bool) {
        match (code * 10.0).round() as i64 {
            0 => self.motion = Some(Motion::Rapid),
            10 => self.motion = Some(Motion::Linear),
            20 => self.motion = Some(Motion::ArcCw),
            30 => self.motion = Some(Motion::ArcCcw),
            // Dwell, offsets, homing, machine moves and probing; the end
            // position is not known from the words alone.
            40 | 100 | 280 | 281 | 300 | 301 | 382..=385 | 530 | 920 | 921 => {
                *non_modal = true
            }
            170 => self.plane = Plane::Xy,
            180 => self.plane = Plane::Zx,
            190 => self.plane = Plane::Yz,
            200 => self.inches = true,
            210 => self.inches = false,
            800 => self.motion = None,
            900 => self.absolute = true,
            910 => self.absolute = false,
            _ => debug!(category = "eta", code, "Ignoring G word"),
        }
    }
}

fn norm(delta: &[f64; 3]) -> f64 {
    (delta[0] * delta[0] + delta[1] * delta[1] + delta[2] * delta[2]).sqrt()
}

/// Length of an XY arc (helical when Z changes) in centre or radius format.
fn arc_length_xy(
    start: [f64; 3],
    end: [f64; 3],
    offsets: [Option<f64>; 2],
    radius: Option<f64>,
    clockwise: bool,
) -> f64 {
    let chord = (end[0] - start[0]).hypot(end[1] - start[1]);
    let dz = end[2] - start[2];

    let planar = if offsets.iter().any(Option::is_some) {
        let cx = start[0] + offsets[0].unwrap_or(0.0);
        let cy = start[1] + offsets[1].unwrap_or(0.0);
        let r = (start[0] - cx).hypot(start[1] - cy);
        let a0 = (start[1] - cy).atan2(start[0] - cx);
        let a1 = (end[1] - cy).atan2(end[0] - cx);
        let mut sweep = if clockwise { a0 - a1 } else { a1 - a0 };
        if sweep <= 1e-9 {
            sweep += TAU;
        }
        r * sweep
    } else if let Some(r) = radius {
        let r_abs = r.abs();
        if r_abs <= 0.0 {
            chord
        } else {
            let mut sweep = 2.0 * (chord / (2.0 * r_abs)).min(1.0).asin();
            // A negative radius selects the long way round.
            if r < 0.0 {
                sweep = TAU - sweep;
            }
            r_abs * sweep
        }
    } else {
        debug!(category = "eta", "Arc without centre or radius, using chord");
        chord
    };

    planar.hypot(dz)
}

/// Time to travel `distance` mm starting and ending at rest.
fn move_time(distance: f64, velocity: f64, acceleration: f64) -> f64 {
    if velocity <= 0.0 {
        return 0.0;
    }
    if acceleration <= 0.0 {
        return distance / velocity;
    }
    let ramp_distance = velocity * velocity / acceleration;
    if distance >= ramp_distance {
        2.0 * velocity / acceleration + (distance - ramp_distance) / velocity
    } else {
        2.0 * (distance / acceleration).sqrt()
    }
}

/// Total and per-line estimate of a program.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Estimate {
    pub total_seconds: f64,
    /// Seconds for each program line, in order
    pub line_seconds: Vec<f64>,
}

impl Estimate {
    /// Seconds left once `completed` lines are done.
    pub fn remaining_seconds(&self, completed: usize) -> f64 {
        self.line_seconds.iter().skip(completed).sum()
    }
}

/// Estimated seconds for a whole program.
pub fn estimate_seconds(program: &str, limits: &MachineLimits) -> f64 {
    let mut estimator = Estimator::new(*limits);
    program.lines().map(|line| estimator.line(line)).sum()
}

/// Per-line estimate of a program.
pub fn estimate_lines<'a, I>(lines: I, limits: &MachineLimits) -> Estimate
where
    I: IntoIterator<Item = &'a str>,
{
    let mut estimator = Estimator::new(*limits);
    let line_seconds: Vec<f64> = lines.into_iter().map(|line| estimator.line(line)).collect();
    Estimate {
        total_seconds: line_seconds.iter().sum(),
        line_seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn approx_eq(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-6, "{a} != {b}");
    }

    #[test]
    fn test_trapezoid_profile() {
        // 100 mm/s reached after 25 mm, cruise 50 mm.
        approx_eq(estimate_seconds("G1 X100 F6000", &MachineLimits::default()), 1.5);
    }

    #[test]
    fn test_triangular_profile() {
        approx_eq(move_time(10.0, 100.0, 200.0), 2.0 * (10.0f64 / 200.0).sqrt());
        approx_eq(move_time(10.0, 100.0, 0.0), 0.1);
    }

    #[test]
    fn test_zero_length_and_non_motion_lines() {
        let limits = MachineLimits::default();
        approx_eq(estimate_seconds("G0 X0 Y0 Z0", &limits), 0.0);
        approx_eq(estimate_seconds("M3 S1000\nG4 P1\nG21 G90", &limits), 0.0);
    }

    #[test]
    fn test_feed_move_without_feed_is_free() {
        approx_eq(estimate_seconds("G1 X10", &MachineLimits::default()), 0.0);
    }

    #[test]
    fn test_xy_arc_uses_arc_length() {
        let estimator_len = arc_length_xy([0.0; 3], [10.0, 0.0, 0.0], [Some(5.0), Some(0.0)], None, true);
        approx_eq(estimator_len, 5.0 * PI);

        // Counter-clockwise takes the other half circle, same length here.
        let ccw = arc_length_xy([0.0; 3], [10.0, 0.0, 0.0], [Some(5.0), Some(0.0)], None, false);
        approx_eq(ccw, 5.0 * PI);

        // Quarter circle: CW from (0,5) around origin to (5,0).
        let quarter = arc_length_xy([0.0, 5.0, 0.0], [5.0, 0.0, 0.0], [Some(0.0), Some(-5.0)], None, true);
        approx_eq(quarter, 2.5 * PI);
        let three_quarter =
            arc_length_xy([0.0, 5.0, 0.0], [5.0, 0.0, 0.0], [Some(0.0), Some(-5.0)], None, false);
        approx_eq(three_quarter, 7.5 * PI);

        let full = arc_length_xy([5.0, 0.0, 0.0], [5.0, 0.0, 0.0], [Some(-5.0), None], None, true);
        approx_eq(full, 10.0 * PI);
    }

    #[test]
    fn test_arc_time_is_not_chord_time() {
        let limits = MachineLimits::default();
        let arc = estimate_seconds("G2 X10 Y0 I5 J0 F300", &limits);
        let chord = estimate_seconds("G1 X10 Y0 F300", &limits);
        approx_eq(arc, 2.0 * 5.0 / 200.0 + (5.0 * PI - 0.125) / 5.0);
        assert!(arc > chord);
    }

    #[test]
    fn test_radius_format_arc() {
        approx_eq(arc_length_xy([0.0; 3], [10.0, 0.0, 0.0], [None, None], Some(5.0), true), 5.0 * PI);
        approx_eq(
            arc_length_xy([0.0, 5.0, 0.0], [5.0, 0.0, 0.0], [None, None], Some(-5.0), true),
            7.5 * PI,
        );
    }

    #[test]
    fn test_zx_arc_uses_chord() {
        let limits = MachineLimits::default();
        let arc = estimate_seconds("G18\nG2 X10 Z0 I5 K0 F300", &limits);
        let chord = estimate_seconds("G1 X10 F300", &limits);
        approx_eq(arc, chord);
    }

    #[test]
    fn test_rapid_clamped_to_axis_group() {
        let limits = MachineLimits {
            xy_acceleration: 0.0,
            z_acceleration: 0.0,
            ..MachineLimits::default()
        };
        // Z rapid: 3000 mm/min = 50 mm/s
        approx_eq(estimate_seconds("G0 Z-10", &limits), 0.2);
        // Feed above the rapid rate is clamped to it.
        approx_eq(estimate_seconds("G1 X1000 F60000", &limits), 6.0);
    }

    #[test]
    fn test_modal_units_and_distance() {
        let limits = MachineLimits {
            xy_acceleration: 0.0,
            ..MachineLimits::default()
        };
        let mut estimator = Estimator::new(limits);
        approx_eq(estimator.line("G20 G91 G1 X1 F60"), 1.0);
        approx_eq(estimator.line("X1"), 1.0);
        assert_eq!(estimator.position(), [50.8, 0.0, 0.0]);
        estimator.line("G21 G90 G0 X0");
        assert_eq!(estimator.position(), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_non_modal_coordinates_do_not_move() {
        let mut estimator = Estimator::new(MachineLimits::default());
        estimator.line("G1 X10 F600");
        approx_eq(estimator.line("G28 X0 Y0"), 0.0);
        approx_eq(estimator.line("G92 X0"), 0.0);
        assert_eq!(estimator.position(), [10.0, 0.0, 0.0]);
    }

    #[test]
    fn test_decimal_g_codes_keep_distance_mode() {
        let limits = MachineLimits::default();
        let program = "G1 X10 F600\nG1 X10\nG1 X10\n";
        let plain = estimate_seconds(&format!("G90\n{program}"), &limits);
        // Arc centre mode must not switch the distance mode.
        let decimal = estimate_seconds(&format!("G90 G91.1\n{program}"), &limits);
        approx_eq(decimal, plain);

        let mut estimator = Estimator::new(limits);
        estimator.line("G90.1 G1 X5 F600");
        estimator.line("G91.1 X5");
        assert_eq!(estimator.position(), [5.0, 0.0, 0.0]);
        approx_eq(estimator.line("G38.2 Z-10 F100"), 0.0);
        assert_eq!(estimator.position(), [5.0, 0.0, 0.0]);
    }

    #[test]
    fn test_per_line_estimate() {
        let program = ["G21", "G1 X100 F6000 ; cut", "(pause)", "G1 X0"];
        let estimate = estimate_lines(program, &MachineLimits::default());
        assert_eq!(estimate.line_seconds.len(), 4);
        approx_eq(estimate.line_seconds[1], 1.5);
        approx_eq(estimate.line_seconds[2], 0.0);
        approx_eq(estimate.total_seconds, 3.0);
        approx_eq(estimate.remaining_seconds(2), 1.5);
        approx_eq(estimate.remaining_seconds(10), 0.0);
    }
}
