//! Core data models for augur.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Concrete types with compile-time guarantees
//! - B_i (Beliefs): Extracted probabilities and fitted stages wrapped in Option/Result
//! - I^R (Resolvable): Heuristic constants exposed as config parameters
//! - I^B (Bounded): Error variants and reply statuses with fallback strategies

mod config;
mod error;
mod reply;
mod statistics;

pub use config::*;
pub use error::*;
pub use reply::*;
pub use statistics::*;
