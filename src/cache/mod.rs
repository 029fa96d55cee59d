//! Persistent reply cache.

mod store;

pub use store::*;
