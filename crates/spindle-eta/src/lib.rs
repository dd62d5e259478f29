//! Advisory motion-time estimates for G-code programs.
//!
//! ```text
//! let seconds = estimate_seconds("G1 X100 F6000", &MachineLimits::default());
//! ```

pub mod estimator;
pub mod limits;
pub mod words;

pub use estimator::{estimate_lines, estimate_seconds, Estimate, Estimator};
pub use limits::{AxisGroup, MachineLimits};
