//! Humanise Optimizer - Adam with persistable moments
//!
//! Explicit gradient accumulation plus an Adam implementation whose state can
//! be written to and restored from a checkpoint.

pub mod adam;
pub mod gradients;

pub use adam::{Adam, AdamConfig};
pub use gradients::{named_vars, Gradients};

/// Optimizer crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
