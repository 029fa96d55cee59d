//! Query orchestration.
//!
//! Epistemic foundation:
//! - K_i: One reply per (source, iteration), failures included
//! - B_i: Sources respond independently → parallel dispatch per source
//! - I^R: Concurrency, delays and budgets come from `[query]`

mod progress;
mod query;

pub use progress::*;
pub use query::*;
