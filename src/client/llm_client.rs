//! HTTP query capability for OpenAI-compatible chat endpoints (OpenRouter by default).
//!
//! Epistemic foundation:
//! - K_i: The chat-completions schema is shared by OpenRouter and most gateways
//! - B_i: API will respond within timeout (might fail)
//! - B_i: A 200 response may still carry an error body → structured QueryError
//! - I^B: Network availability unknowable → bounded retry with backoff

use super::{QueryCapability, QueryParams, RateLimiter};
use crate::models::{
    AugurError, Config, OpenRouterConfig, QueryError, QueryErrorKind, RawReply, Result, TokenUsage,
};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct WebSearch {
    engine: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    web_search: Option<WebSearch>,
}

impl<'a> ChatCompletionRequest<'a> {
    fn new(source_id: &'a str, prompt: &'a str, params: &QueryParams) -> Self {
        Self {
            model: source_id,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            max_tokens: params.max_output_tokens,
            temperature: params.temperature,
            web_search: params.web_search.then_some(WebSearch { engine: "native" }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
    model: Option<String>,
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    /// Null when the provider produced nothing
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
    /// Numeric HTTP-like code on OpenRouter, free-form string elsewhere
    code: Option<serde_json::Value>,
}

impl ApiErrorDetail {
    fn into_query_error(self) -> QueryError {
        match self.code.as_ref().and_then(serde_json::Value::as_u64) {
            Some(code) if (100..600).contains(&code) => QueryError::from_status(code as u16, self.message),
            _ => QueryError::new(QueryErrorKind::from_message(&self.message), self.message),
        }
    }
}

/// Decode a 200 response body into a raw reply.
fn parse_completion(body: &str) -> std::result::Result<RawReply, QueryError> {
    let response: ChatCompletionResponse = serde_json::from_str(body).map_err(|e| {
        QueryError::new(QueryErrorKind::InvalidResponse, format!("failed to parse response: {e}"))
    })?;

    if let Some(error) = response.error {
        return Err(error.into_query_error());
    }

    Ok(RawReply {
        text: response.choices.into_iter().next().and_then(|c| c.message.content),
        usage: response.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }),
        model: response.model,
    })
}

/// Decode a non-success response body into a structured error.
fn parse_error(status: u16, body: &str) -> QueryError {
    let message = serde_json::from_str::<ApiErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.chars().take(500).collect());
    QueryError::from_status(status, message)
}

/// Chat-completions client implementing [`QueryCapability`].
pub struct LLMClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    max_retries: u32,
    rate_limiter: Arc<RateLimiter>,
    total_prompt_tokens: AtomicU64,
    total_completion_tokens: AtomicU64,
}

impl LLMClient {
    pub fn new(
        api_key: String,
        config: &OpenRouterConfig,
        rate_limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(AugurError::Network)?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries.max(1),
            rate_limiter: rate_limiter.unwrap_or_default(),
            total_prompt_tokens: AtomicU64::new(0),
            total_completion_tokens: AtomicU64::new(0),
        })
    }

    /// Build a client from the `[openrouter]` section, resolving the API key.
    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        Self::new(api_key, &config.openrouter, None)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// (prompt, completion) tokens consumed by this client so far.
    pub fn token_usage(&self) -> (u64, u64) {
        (
            self.total_prompt_tokens.load(Ordering::Relaxed),
            self.total_completion_tokens.load(Ordering::Relaxed),
        )
    }

    fn headers(&self) -> std::result::Result<HeaderMap, QueryError> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.api_key)).map_err(|_| {
            QueryError::new(QueryErrorKind::Authentication, "API key is not a valid header value")
        })?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("X-Title", HeaderValue::from_static("augur"));
        Ok(headers)
    }

    fn backoff(attempt: u32) -> Duration {
        Duration::from_secs(2u64.pow(attempt.min(6)))
    }
}

#[async_trait]
impl QueryCapability for LLMClient {
    async fn query(
        &self,
        source_id: &str,
        prompt: &str,
        params: &QueryParams,
    ) -> std::result::Result<RawReply, QueryError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatCompletionRequest::new(source_id, prompt, params);
        let headers = self.headers()?;
        let mut last_error = QueryError::new(QueryErrorKind::Other, "no attempt made");

        for attempt in 0..self.max_retries {
            let final_attempt = attempt + 1 == self.max_retries;
            self.rate_limiter.wait_if_needed(source_id).await;

            let response = match self
                .client
                .post(&url)
                .headers(headers.clone())
                .json(&request)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    let kind = if e.is_timeout() {
                        QueryErrorKind::Timeout
                    } else {
                        QueryErrorKind::Network
                    };
                    last_error = QueryError::new(kind, e.to_string());
                    if !final_attempt {
                        debug!(source = source_id, attempt, error = %e, "Retrying after network error");
                        tokio::time::sleep(Self::backoff(attempt)).await;
                    }
                    continue;
                }
            };

            let status = response.status().as_u16();
            self.rate_limiter
                .record_response(source_id, status, response.headers());

            if status == 429 {
                // The limiter holds the backoff; the next wait_if_needed honours it.
                last_error = QueryError::from_status(status, "rate limited by provider");
                continue;
            }

            let body = response
                .text()
                .await
                .map_err(|e| QueryError::new(QueryErrorKind::Network, e.to_string()))?;

            if !(200..300).contains(&status) {
                last_error = parse_error(status, &body);
                if (status >= 500 || last_error.is_retryable()) && !final_attempt {
                    debug!(source = source_id, attempt, status, "Retrying after server error");
                    tokio::time::sleep(Self::backoff(attempt)).await;
                    continue;
                }
                return Err(last_error);
            }

            let raw = parse_completion(&body)?;
            if let Some(usage) = raw.usage {
                self.total_prompt_tokens
                    .fetch_add(usage.prompt_tokens as u64, Ordering::Relaxed);
                self.total_completion_tokens
                    .fetch_add(usage.completion_tokens as u64, Ordering::Relaxed);
            }
            debug!(
                source = source_id,
                chars = raw.text.as_deref().map_or(0, str::len),
                "Received completion"
            );
            return Ok(raw);
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let params = QueryParams {
            max_output_tokens: 8000,
            temperature: 0.7,
            web_search: true,
        };
        let request = ChatCompletionRequest::new("google/gemini-2.5-pro", "Will it rain?", &params);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "google/gemini-2.5-pro");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["max_tokens"], 8000);
        assert_eq!(json["web_search"]["engine"], "native");

        let no_search = QueryParams {
            web_search: false,
            ..params
        };
        let json = serde_json::to_value(ChatCompletionRequest::new("m", "p", &no_search)).unwrap();
        assert!(json.get("web_search").is_none());
    }

    #[test]
    fn test_parse_completion_tolerates_null_content() {
        let raw = parse_completion(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        assert_eq!(raw.text, None);

        let raw = parse_completion(r#"{"choices":[]}"#).unwrap();
        assert_eq!(raw.text, None);

        let body = r#"{"model":"x/y","choices":[{"message":{"content":"PROGNOSE: 40%"}}],
            "usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        let raw = parse_completion(body).unwrap();
        assert_eq!(raw.text.as_deref(), Some("PROGNOSE: 40%"));
        assert_eq!(raw.usage.unwrap().total_tokens, 15);
        assert_eq!(raw.model.as_deref(), Some("x/y"));
    }

    #[test]
    fn test_embedded_error_is_structured() {
        let err = parse_completion(r#"{"error":{"message":"Provider returned error","code":429}}"#)
            .unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::RateLimited);
        assert_eq!(err.status, Some(429));

        let err = parse_completion(r#"{"error":{"message":"No endpoints found for foo/bar"}}"#)
            .unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::NotFound);

        let err = parse_completion("not json").unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::InvalidResponse);
    }

    #[test]
    fn test_error_body_classification() {
        let err = parse_error(404, r#"{"error":{"message":"model not found","code":404}}"#);
        assert_eq!(err.kind, QueryErrorKind::NotFound);
        assert_eq!(err.message, "model not found");

        let err = parse_error(503, "upstream unavailable");
        assert_eq!(err.kind, QueryErrorKind::Other);
        assert_eq!(err.status, Some(503));
    }

    #[test]
    fn test_client_from_config() {
        let config = OpenRouterConfig {
            base_url: "https://example.invalid/api/v1/".to_string(),
            ..Default::default()
        };
        let client = LLMClient::new("sk-test".to_string(), &config, None).unwrap();
        assert_eq!(client.base_url(), "https://example.invalid/api/v1");
        assert_eq!(client.token_usage(), (0, 0));
        assert!(client.headers().is_ok());
    }
}
