//! Pipeline module - end-to-end forecast batches and their run records.

mod forecast;

pub use forecast::*;
