//! Machine kinematic limits used by the estimator.

use serde::{Deserialize, Serialize};

/// Rates in mm/min, accelerations in mm/s².
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineLimits {
    /// Rapid rate of the X/Y axes
    pub xy_max_rate: f64,
    /// Rapid rate of the Z axis
    pub z_max_rate: f64,
    pub xy_acceleration: f64,
    pub z_acceleration: f64,
}

impl Default for MachineLimits {
    fn default() -> Self {
        Self {
            xy_max_rate: 10_000.0,
            z_max_rate: 3_000.0,
            xy_acceleration: 200.0,
            z_acceleration: 100.0,
        }
    }
}

/// Axis group whose limits govern a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisGroup {
    Xy,
    Z,
}

impl MachineLimits {
    /// Rapid rate of `group` in mm/s.
    pub fn rate_mm_s(&self, group: AxisGroup) -> f64 {
        match group {
            AxisGroup::Xy => self.xy_max_rate / 60.0,
            AxisGroup::Z => self.z_max_rate / 60.0,
        }
    }

    pub fn acceleration(&self, group: AxisGroup) -> f64 {
        match group {
            AxisGroup::Xy => self.xy_acceleration,
            AxisGroup::Z => self.z_acceleration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_table_keeps_defaults() {
        let limits: MachineLimits = toml::from_str("xy_acceleration = 500.0").unwrap();
        assert_eq!(limits.xy_acceleration, 500.0);
        assert_eq!(limits.xy_max_rate, 10_000.0);
        assert_eq!(limits.rate_mm_s(AxisGroup::Z), 50.0);
    }
}
