//! Statistical aggregation of forecast probabilities.
//!
//! Epistemic mapping:
//! - K_i: Every stage is synchronous and deterministic given its inputs
//! - B_i: Degenerate input degrades to a documented default, never a panic
//! - I^B: Only the Bayesian stage carries state between calls (bounded history)

mod aggregator;
mod bayesian;
mod calibration;
mod consistency;
pub mod stats;

pub use aggregator::*;
pub use bayesian::*;
pub use calibration::*;
pub use consistency::*;
