//! Plugins shipped with the engine.

pub mod dust_boot;

pub use dust_boot::{AutoDustBoot, DustBootSettings};
