//! augur - Ensemble forecast collection and robust probability aggregation via OpenRouter.
//!
//! ## Architecture
//!
//! A forecast batch asks N sources the same prompt M times each:
//! - **Orchestrator**: Dispatches queries under a global concurrency limit,
//!   throttles rate-limited sources, caches successful replies
//! - **Extractor**: Pulls a percentage out of free-form reply text
//! - **Aggregator**: Consistency scoring → calibration → robust Bayesian pooling,
//!   blended into one recommended estimate
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Network/API uncertainties (retry, backoff, timeouts)

pub mod analysis;
pub mod cache;
pub mod client;
pub mod extract;
pub mod models;
pub mod orchestrator;
pub mod pipeline;

// Re-exports for convenience
pub use analysis::{BatchCalibrator, BayesianAggregator, ConsistencyScorer, ForecastAggregator};
pub use cache::ReplyStore;
pub use client::{LLMClient, QueryCapability, QueryParams, RateLimiter};
pub use extract::ProbabilityExtractor;
pub use models::{AugurError, Config, EnsembleStatistics, Reply, ReplyStatus, Result};
pub use orchestrator::{BatchProgress, CancelFlag, ProgressSink, QueryOrchestrator};
pub use pipeline::{ForecastPipeline, ForecastRun};
