//! Reply records produced by the query orchestrator.
//!
//! Epistemic foundation:
//! - K_i: A reply is immutable once created, owned by its batch
//! - K_i: `status == Success` implies non-empty text
//! - B_i: Probability extraction may fail → Option
//! - I^B: Any query may fail → explicit error status, never dropped

use super::QueryErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of one query attempt.
///
/// K_i: Variants are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    /// Text present, probability extraction attempted
    Success,
    /// Text absent or below the minimum length
    EmptyResponse,
    /// Text matches known safety-refusal phrasing
    Rejected,
    Timeout,
    RateLimited,
    /// Unknown source identifier
    NotFound,
    /// Malformed request
    InvalidModel,
    /// Uncategorized failure
    Error,
}

impl ReplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::EmptyResponse => "empty_response",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::NotFound => "not_found",
            Self::InvalidModel => "invalid_model",
            Self::Error => "error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<QueryErrorKind> for ReplyStatus {
    fn from(kind: QueryErrorKind) -> Self {
        match kind {
            QueryErrorKind::Timeout => Self::Timeout,
            QueryErrorKind::RateLimited => Self::RateLimited,
            QueryErrorKind::NotFound => Self::NotFound,
            QueryErrorKind::InvalidRequest => Self::InvalidModel,
            QueryErrorKind::Authentication
            | QueryErrorKind::Network
            | QueryErrorKind::InvalidResponse
            | QueryErrorKind::Other => Self::Error,
        }
    }
}

/// Token usage counters reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Raw answer from the query capability, before classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawReply {
    /// Generated text (providers may return null content)
    pub text: Option<String>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    /// Model that actually served the request, if reported
    #[serde(default)]
    pub model: Option<String>,
}

impl RawReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            usage: None,
            model: None,
        }
    }
}

/// One response from one source for one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub source_id: String,
    /// 1-based iteration number within the source
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Extracted probability in [0, 100]
    #[serde(default)]
    pub probability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub from_cache: bool,
}

impl Reply {
    /// A reply that carries text (success, empty or rejected).
    ///
    /// Probabilities outside [0, 100] are dropped; success without text
    /// is demoted to `EmptyResponse`.
    pub fn answered(
        source_id: &str,
        iteration: u32,
        status: ReplyStatus,
        raw: RawReply,
        probability: Option<f64>,
        elapsed_ms: u64,
    ) -> Self {
        let has_text = raw.text.as_deref().is_some_and(|t| !t.trim().is_empty());
        let status = if status.is_success() && !has_text {
            ReplyStatus::EmptyResponse
        } else {
            status
        };

        Self {
            source_id: source_id.to_string(),
            iteration,
            timestamp: Utc::now(),
            elapsed_ms,
            status,
            text: raw.text,
            probability: probability.filter(|p| (0.0..=100.0).contains(p)),
            usage: raw.usage,
            error: None,
            from_cache: false,
        }
    }

    /// A reply for a query that produced no usable answer.
    pub fn failed(
        source_id: &str,
        iteration: u32,
        status: ReplyStatus,
        error: impl Into<String>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            iteration,
            timestamp: Utc::now(),
            elapsed_ms,
            status,
            text: None,
            probability: None,
            usage: None,
            error: Some(error.into()),
            from_cache: false,
        }
    }

    /// Stable identifier of this reply within its batch.
    pub fn ensemble_id(&self) -> String {
        format!("{}_{:02}", self.source_id, self.iteration)
    }

    /// Probability if this reply is usable for aggregation.
    pub fn valid_probability(&self) -> Option<f64> {
        if self.status.is_success() {
            self.probability
        } else {
            None
        }
    }
}

/// All replies of one source. Derived per aggregation request.
#[derive(Debug, Clone)]
pub struct SourceBatch<'a> {
    pub source_id: &'a str,
    pub replies: Vec<&'a Reply>,
}

impl SourceBatch<'_> {
    /// Usable probabilities in iteration order.
    pub fn probabilities(&self) -> Vec<f64> {
        self.replies
            .iter()
            .filter_map(|r| r.valid_probability())
            .collect()
    }

    pub fn successful(&self) -> usize {
        self.replies.iter().filter(|r| r.status.is_success()).count()
    }

    pub fn success_rate(&self) -> f64 {
        if self.replies.is_empty() {
            0.0
        } else {
            self.successful() as f64 / self.replies.len() as f64
        }
    }
}

/// Group replies by source, in order of first appearance.
pub fn group_by_source(replies: &[Reply]) -> Vec<SourceBatch<'_>> {
    let mut batches: Vec<SourceBatch<'_>> = Vec::new();
    for reply in replies {
        match batches.iter_mut().find(|b| b.source_id == reply.source_id) {
            Some(batch) => batch.replies.push(reply),
            None => batches.push(SourceBatch {
                source_id: &reply.source_id,
                replies: vec![reply],
            }),
        }
    }
    for batch in &mut batches {
        batch.replies.sort_by_key(|r| r.iteration);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(source: &str, iteration: u32, p: f64) -> Reply {
        Reply::answered(
            source,
            iteration,
            ReplyStatus::Success,
            RawReply::text(format!("PROGNOSE: {p}%")),
            Some(p),
            5,
        )
    }

    #[test]
    fn test_success_without_text_is_empty() {
        let reply = Reply::answered("a", 1, ReplyStatus::Success, RawReply::text("  "), None, 1);
        assert_eq!(reply.status, ReplyStatus::EmptyResponse);
    }

    #[test]
    fn test_out_of_range_probability_dropped() {
        let reply = Reply::answered(
            "a",
            1,
            ReplyStatus::Success,
            RawReply::text("PROGNOSE: 150%"),
            Some(150.0),
            1,
        );
        assert_eq!(reply.probability, None);
    }

    #[test]
    fn test_ensemble_id() {
        assert_eq!(success("openai/gpt-4o", 3, 40.0).ensemble_id(), "openai/gpt-4o_03");
        assert_eq!(success("x", 12, 40.0).ensemble_id(), "x_12");
    }

    #[test]
    fn test_status_from_error_kind() {
        assert_eq!(ReplyStatus::from(QueryErrorKind::Timeout), ReplyStatus::Timeout);
        assert_eq!(
            ReplyStatus::from(QueryErrorKind::InvalidRequest),
            ReplyStatus::InvalidModel
        );
        assert_eq!(ReplyStatus::from(QueryErrorKind::Network), ReplyStatus::Error);
    }

    #[test]
    fn test_group_by_source() {
        let replies = vec![
            success("b", 2, 32.0),
            success("a", 1, 30.0),
            Reply::failed("b", 1, ReplyStatus::Timeout, "deadline", 120_000),
            success("a", 2, 31.0),
        ];

        let batches = group_by_source(&replies);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].source_id, "b");
        assert_eq!(batches[0].replies[0].iteration, 1);
        assert_eq!(batches[0].probabilities(), vec![32.0]);
        assert!((batches[0].success_rate() - 0.5).abs() < 1e-12);
        assert_eq!(batches[1].probabilities(), vec![30.0, 31.0]);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ReplyStatus::EmptyResponse).unwrap();
        assert_eq!(json, "\"empty_response\"");
        assert_eq!(ReplyStatus::InvalidModel.to_string(), "invalid_model");
    }
}
