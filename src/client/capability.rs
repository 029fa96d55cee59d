//! The query capability seam between the orchestrator and a text-generation backend.

use crate::models::{QueryError, RawReply};
use async_trait::async_trait;

/// Per-query generation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryParams {
    pub max_output_tokens: u32,
    pub temperature: f64,
    /// Ask the provider to ground the answer with its native web search
    pub web_search: bool,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            max_output_tokens: 4000,
            temperature: 0.7,
            web_search: true,
        }
    }
}

/// Anything that can answer a prompt on behalf of a source.
///
/// Failures are structured (`QueryError`) so callers classify them by
/// kind, never by message text.
#[async_trait]
pub trait QueryCapability: Send + Sync {
    async fn query(
        &self,
        source_id: &str,
        prompt: &str,
        params: &QueryParams,
    ) -> std::result::Result<RawReply, QueryError>;
}
