//! Per-source adaptive throttle for the HTTP query client.
//!
//! Epistemic foundation:
//! - K_i: Providers report remaining quota in `x-ratelimit-*` headers
//! - K_i: Consecutive 429s require exponential backoff (2^n s, capped at 60 s)
//! - B_i: `retry-after` is a lower bound on the next safe attempt
//! - I^B: Quotas are unknown until the first response for a source

use dashmap::DashMap;
use reqwest::header::HeaderMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const MAX_BACKOFF_SECS: f64 = 60.0;

/// Throttle state for one source.
#[derive(Debug, Default)]
pub struct SourceThrottle {
    pub remaining_requests: Option<u32>,
    pub reset_at: Option<Instant>,
    pub consecutive_429s: u32,
    pub backoff_until: Option<Instant>,
}

impl SourceThrottle {
    /// How long to wait before the next request; zero if clear.
    pub fn wait_time(&self, now: Instant) -> Duration {
        let backoff = self
            .backoff_until
            .map_or(Duration::ZERO, |t| t.saturating_duration_since(now));
        let quota = match (self.remaining_requests, self.reset_at) {
            (Some(0), Some(reset)) => reset.saturating_duration_since(now),
            _ => Duration::ZERO,
        };
        backoff.max(quota)
    }

    fn record_429(&mut self, retry_after: Option<Duration>, now: Instant) {
        self.consecutive_429s += 1;
        let exponential =
            Duration::from_secs_f64(2f64.powi(self.consecutive_429s as i32).min(MAX_BACKOFF_SECS));
        let backoff = retry_after.map_or(exponential, |r| r.max(exponential));
        self.backoff_until = Some(now + backoff);
        warn!(
            consecutive_429s = self.consecutive_429s,
            backoff_secs = backoff.as_secs_f64(),
            "Rate limited (429), backing off"
        );
    }

    fn record_success(&mut self) {
        self.consecutive_429s = 0;
        self.backoff_until = None;
    }

    fn update_from_headers(&mut self, headers: &HeaderMap, now: Instant) {
        if let Some(remaining) = header_value::<u32>(headers, "x-ratelimit-remaining-requests") {
            self.remaining_requests = Some(remaining);
        }
        if let Some(secs) = header_value::<f64>(headers, "x-ratelimit-reset-requests")
            .filter(|s| s.is_finite() && *s >= 0.0)
        {
            self.reset_at = Some(now + Duration::from_secs_f64(secs));
        }
    }
}

fn header_value<T: std::str::FromStr>(headers: &HeaderMap, key: &str) -> Option<T> {
    headers.get(key)?.to_str().ok()?.trim().parse().ok()
}

/// Parse a `retry-after` header given in seconds.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_value::<f64>(headers, "retry-after")
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(|s| Duration::from_secs_f64(s.min(MAX_BACKOFF_SECS)))
}

/// Adaptive rate limiter shared by all queries of one client.
#[derive(Debug, Default)]
pub struct RateLimiter {
    sources: DashMap<String, SourceThrottle>,
    total_requests: AtomicU64,
    total_429s: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep until `source_id` is clear to send. Returns the time waited.
    pub async fn wait_if_needed(&self, source_id: &str) -> Duration {
        let wait = self
            .sources
            .get(source_id)
            .map_or(Duration::ZERO, |s| s.wait_time(Instant::now()));

        if !wait.is_zero() {
            debug!(source = source_id, wait_ms = wait.as_millis() as u64, "Waiting for rate limit");
            self.total_wait_ms
                .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Record a response for `source_id`.
    pub fn record_response(&self, source_id: &str, status: u16, headers: &HeaderMap) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut state = self.sources.entry(source_id.to_string()).or_default();
        state.update_from_headers(headers, now);

        if status == 429 {
            self.total_429s.fetch_add(1, Ordering::Relaxed);
            state.record_429(retry_after(headers), now);
        } else if status < 400 {
            state.record_success();
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_429s = self.total_429s.load(Ordering::Relaxed);
        RateLimiterStats {
            total_requests,
            total_429s,
            total_wait_secs: self.total_wait_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            sources_tracked: self.sources.len(),
        }
    }
}

/// Rate limiter statistics.
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_429s: u64,
    pub total_wait_secs: f64,
    pub sources_tracked: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut state = SourceThrottle::default();
        let now = Instant::now();

        state.record_429(None, now);
        assert_eq!(state.wait_time(now), Duration::from_secs(2));
        state.record_429(None, now);
        assert_eq!(state.wait_time(now), Duration::from_secs(4));

        for _ in 0..10 {
            state.record_429(None, now);
        }
        assert_eq!(state.wait_time(now), Duration::from_secs(60));

        state.record_success();
        assert_eq!(state.wait_time(now), Duration::ZERO);
    }

    #[test]
    fn test_retry_after_extends_backoff() {
        let mut state = SourceThrottle::default();
        let now = Instant::now();
        state.record_429(Some(Duration::from_secs(7)), now);
        assert_eq!(state.wait_time(now), Duration::from_secs(7));
    }

    #[test]
    fn test_exhausted_quota_waits_for_reset() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining-requests", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset-requests", HeaderValue::from_static("5"));

        let limiter = RateLimiter::new();
        limiter.record_response("free/model:free", 200, &headers);

        let state = limiter.sources.get("free/model:free").unwrap();
        let wait = state.wait_time(Instant::now());
        assert!(wait > Duration::from_secs(4) && wait <= Duration::from_secs(5));
        drop(state);

        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.total_429s, 0);
        assert_eq!(stats.sources_tracked, 1);
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert("retry-after", HeaderValue::from_static("2.5"));
        assert_eq!(retry_after(&headers), Some(Duration::from_millis(2500)));
        headers.insert("retry-after", HeaderValue::from_static("soon"));
        assert_eq!(retry_after(&headers), None);
    }
}
