//! Error types for augur.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (bad input, no usable probabilities)
//! - I^B materialized: Infrastructure failures (network, cache, filesystem)
//! - K_i violated: Internal invariant violations (bugs)

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Top-level error type for augur.
#[derive(Debug, Error)]
pub enum AugurError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED: Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient data: {total_replies} replies, none with a usable probability")]
    InsufficientData { total_replies: usize },

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED: Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("Query failed: {0}")]
    Query(#[from] QueryError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED: Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AugurError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Query(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result type alias for augur.
pub type Result<T> = std::result::Result<T, AugurError>;

/// Category of a failed query.
///
/// K_i: Every variant maps onto exactly one reply status, so the
/// orchestrator never inspects human-readable error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryErrorKind {
    /// The query did not complete within its deadline
    Timeout,
    /// Provider throttled the request (HTTP 429)
    RateLimited,
    /// Unknown source identifier (HTTP 404)
    NotFound,
    /// Malformed request (HTTP 400/422)
    InvalidRequest,
    /// Credentials rejected (HTTP 401/403)
    Authentication,
    /// Transport-level failure before a status was received
    Network,
    /// Response arrived but could not be decoded
    InvalidResponse,
    /// Anything else
    Other,
}

impl QueryErrorKind {
    /// Classify an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimited,
            404 => Self::NotFound,
            400 | 422 => Self::InvalidRequest,
            401 | 403 => Self::Authentication,
            408 | 504 => Self::Timeout,
            _ => Self::Other,
        }
    }

    /// Classify a provider error message that arrived without a status code.
    ///
    /// Only used at the HTTP boundary, for error bodies embedded in
    /// otherwise successful responses.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
        {
            Self::RateLimited
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout
        } else if lower.contains("404") || lower.contains("not found") || lower.contains("no endpoints found") {
            Self::NotFound
        } else if lower.contains("400") || lower.contains("invalid") {
            Self::InvalidRequest
        } else if lower.contains("401") || lower.contains("unauthorized") {
            Self::Authentication
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for QueryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate limited",
            Self::NotFound => "not found",
            Self::InvalidRequest => "invalid request",
            Self::Authentication => "authentication failed",
            Self::Network => "network error",
            Self::InvalidResponse => "invalid response",
            Self::Other => "error",
        };
        f.write_str(s)
    }
}

/// Structured failure returned by a query capability.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// HTTP status, when one was received
    pub status: Option<u16>,
    pub message: String,
}

impl QueryError {
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    /// Build an error from an HTTP status and response body.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: QueryErrorKind::from_status(status),
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Timeout, message)
    }

    /// Check if another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            QueryErrorKind::Timeout | QueryErrorKind::RateLimited | QueryErrorKind::Network
        )
    }
}
