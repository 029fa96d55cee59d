//! Concurrency-controlled querying of sources × iterations.
//!
//! Epistemic foundation:
//! - K_i: Every query yields exactly one Reply; failures become error replies, never drops
//! - K_i: Iteration numbers are fixed at dispatch, independent of completion order
//! - B_i: Rate-limited sources throttle aggressively → one query at a time, with a delay
//! - B_i: An empty reply from a rate-limited source is often truncation → one retry with a larger budget
//! - I^B: Query latency unbounded → per-query timeout

use super::{CancelFlag, ProgressSink};
use crate::cache::ReplyStore;
use crate::client::{QueryCapability, QueryParams};
use crate::extract::ProbabilityExtractor;
use crate::models::{QueryConfig, RawReply, Reply, ReplyStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Replies shorter than this are logged as suspicious.
const SHORT_REPLY_CHARS: usize = 100;

/// Phrases marking a safety refusal rather than an answer.
const REFUSAL_PHRASES: [&str; 6] = [
    "cannot ignore my safety instructions",
    "must decline this request",
    "attempt to override",
    "cannot comply with",
    "against my programming",
    "violates my guidelines",
];

fn is_refusal(text: &str) -> bool {
    let lower = text.to_lowercase();
    REFUSAL_PHRASES.iter().any(|p| lower.contains(p))
}

/// State shared by every query task of an orchestrator.
struct QueryContext {
    capability: Arc<dyn QueryCapability>,
    store: Option<Arc<ReplyStore>>,
    extractor: ProbabilityExtractor,
    config: QueryConfig,
    semaphore: Semaphore,
}

impl QueryContext {
    fn elapsed_ms(start: Instant) -> u64 {
        start.elapsed().as_millis() as u64
    }

    /// Turn a raw answer into a classified Reply.
    fn classify(&self, source_id: &str, iteration: u32, raw: RawReply, start: Instant) -> Reply {
        let elapsed_ms = Self::elapsed_ms(start);
        let length = raw.text.as_deref().map_or(0, |t| t.trim().chars().count());

        if length < self.config.min_reply_chars {
            warn!(source = source_id, iteration, length, "Empty or insufficient response");
            let mut reply =
                Reply::answered(source_id, iteration, ReplyStatus::EmptyResponse, raw, None, elapsed_ms);
            reply.error = Some("empty or insufficient response".to_string());
            return reply;
        }

        let text = raw.text.as_deref().unwrap_or_default();
        if is_refusal(text) {
            warn!(source = source_id, iteration, "Source declined the prompt");
            return Reply::answered(source_id, iteration, ReplyStatus::Rejected, raw, None, elapsed_ms);
        }
        if length < SHORT_REPLY_CHARS {
            warn!(source = source_id, iteration, length, "Short response");
        }

        let probability = self.extractor.extract(text, source_id);
        if probability.is_none() {
            debug!(source = source_id, iteration, "Could not extract probability");
        }
        Reply::answered(source_id, iteration, ReplyStatus::Success, raw, probability, elapsed_ms)
    }

    /// One call to the capability under the per-query timeout.
    async fn attempt(&self, source_id: &str, iteration: u32, prompt: &str, budget: u32) -> Reply {
        let start = Instant::now();
        let params = QueryParams {
            max_output_tokens: budget,
            temperature: self.config.temperature,
            web_search: self.config.web_search,
        };
        let timeout = Duration::from_secs(self.config.query_timeout_secs);

        match tokio::time::timeout(timeout, self.capability.query(source_id, prompt, &params)).await {
            Err(_) => {
                warn!(source = source_id, iteration, timeout_secs = timeout.as_secs(), "Query timed out");
                Reply::failed(
                    source_id,
                    iteration,
                    ReplyStatus::Timeout,
                    format!("query timed out after {}s", timeout.as_secs()),
                    Self::elapsed_ms(start),
                )
            }
            Ok(Err(e)) => {
                warn!(source = source_id, iteration, error = %e, "Query failed");
                Reply::failed(
                    source_id,
                    iteration,
                    ReplyStatus::from(e.kind),
                    e.to_string(),
                    Self::elapsed_ms(start),
                )
            }
            Ok(Ok(raw)) => {
                let reply = self.classify(source_id, iteration, raw.clone(), start);
                if reply.status.is_success() {
                    self.write_back(source_id, prompt, raw).await;
                }
                reply
            }
        }
    }

    /// SQLite calls block, so store access runs on the blocking pool.
    async fn write_back(&self, source_id: &str, prompt: &str, raw: RawReply) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let (source, prompt) = (source_id.to_string(), prompt.to_string());
        match tokio::task::spawn_blocking(move || store.put(&source, &prompt, &raw)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(source = source_id, error = %e, "Failed to cache reply"),
            Err(e) => warn!(source = source_id, error = %e, "Cache write task failed"),
        }
    }

    async fn cached(&self, source_id: &str, iteration: u32, prompt: &str) -> Option<Reply> {
        if self.config.force_refresh {
            return None;
        }
        let store = self.store.clone()?;
        let start = Instant::now();
        let (source, owned_prompt) = (source_id.to_string(), prompt.to_string());
        let lookup = tokio::task::spawn_blocking(move || store.get(&source, &owned_prompt)).await;

        match lookup {
            Ok(Ok(Some(raw))) => {
                debug!(source = source_id, iteration, "Using cached reply");
                let mut reply = self.classify(source_id, iteration, raw, start);
                reply.from_cache = true;
                Some(reply)
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!(source = source_id, error = %e, "Cache lookup failed");
                None
            }
            Err(e) => {
                warn!(source = source_id, error = %e, "Cache lookup task failed");
                None
            }
        }
    }

    /// Cache lookup, query, and the single retry-on-empty for rate-limited sources.
    async fn query_one(&self, source_id: &str, iteration: u32, prompt: &str) -> Reply {
        if let Some(reply) = self.cached(source_id, iteration, prompt).await {
            return reply;
        }

        let budget = self
            .config
            .output_budget(source_id, self.config.max_output_tokens);
        let reply = self.attempt(source_id, iteration, prompt, budget).await;

        if reply.status == ReplyStatus::EmptyResponse && self.config.is_rate_limited(source_id) {
            let retry_budget = budget.max(self.config.retry_output_tokens);
            info!(source = source_id, iteration, retry_budget, "Retrying empty response");
            return self.attempt(source_id, iteration, prompt, retry_budget).await;
        }
        reply
    }
}

/// Drives N sources × M iterations against a query capability.
pub struct QueryOrchestrator {
    ctx: Arc<QueryContext>,
}

impl QueryOrchestrator {
    pub fn new(
        capability: Arc<dyn QueryCapability>,
        store: Option<Arc<ReplyStore>>,
        config: QueryConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(QueryContext {
                capability,
                store,
                extractor: ProbabilityExtractor::new(),
                semaphore: Semaphore::new(config.concurrency.max(1)),
                config,
            }),
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.ctx.config
    }

    /// Query every source `iterations` times.
    ///
    /// Returns `sources.len() * iterations` replies unless cancelled, in
    /// which case the sources completed so far are returned. Within a
    /// source, replies are ordered by iteration.
    pub async fn run(
        &self,
        sources: &[String],
        prompt: &str,
        iterations: u32,
        progress: Arc<dyn ProgressSink>,
        cancel: &CancelFlag,
    ) -> Vec<Reply> {
        let mut replies = Vec::with_capacity(sources.len() * iterations as usize);

        for source_id in sources {
            if cancel.is_cancelled() {
                info!(completed = replies.len(), "Batch cancelled, skipping remaining sources");
                break;
            }

            progress.begin_source(source_id, iterations);
            let batch = if self.ctx.config.is_rate_limited(source_id) {
                self.run_sequential(source_id, prompt, iterations, progress.as_ref())
                    .await
            } else {
                self.run_parallel(source_id, prompt, iterations, &progress).await
            };
            progress.finish_source(source_id);

            let ok = batch.iter().filter(|r| r.status.is_success()).count();
            info!(source = %source_id, successful = ok, total = batch.len(), "Source complete");
            replies.extend(batch);
        }

        replies
    }

    /// Rate-limited sources: one query at a time with a delay in between.
    async fn run_sequential(
        &self,
        source_id: &str,
        prompt: &str,
        iterations: u32,
        progress: &dyn ProgressSink,
    ) -> Vec<Reply> {
        let delay = Duration::from_secs_f64(self.ctx.config.rate_limit_delay_secs.max(0.0));
        let mut batch = Vec::with_capacity(iterations as usize);

        for iteration in 1..=iterations {
            if iteration > 1 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            batch.push(self.ctx.query_one(source_id, iteration, prompt).await);
            progress.advance(source_id, 1);
        }
        batch
    }

    /// Other sources: all iterations in flight, bounded by the global semaphore.
    async fn run_parallel(
        &self,
        source_id: &str,
        prompt: &str,
        iterations: u32,
        progress: &Arc<dyn ProgressSink>,
    ) -> Vec<Reply> {
        let prompt: Arc<str> = Arc::from(prompt);
        let mut handles = Vec::with_capacity(iterations as usize);

        for iteration in 1..=iterations {
            let ctx = Arc::clone(&self.ctx);
            let progress = Arc::clone(progress);
            let prompt = Arc::clone(&prompt);
            let source = source_id.to_string();

            let handle = tokio::spawn(async move {
                let reply = match ctx.semaphore.acquire().await {
                    Ok(_permit) => ctx.query_one(&source, iteration, &prompt).await,
                    Err(_) => Reply::failed(&source, iteration, ReplyStatus::Error, "limiter closed", 0),
                };
                progress.advance(&source, 1);
                reply
            });
            handles.push((iteration, handle));
        }

        let mut batch = Vec::with_capacity(handles.len());
        for (iteration, handle) in handles {
            match handle.await {
                Ok(reply) => batch.push(reply),
                Err(e) => {
                    warn!(source = source_id, iteration, error = %e, "Query task failed");
                    batch.push(Reply::failed(
                        source_id,
                        iteration,
                        ReplyStatus::Error,
                        format!("query task failed: {e}"),
                        0,
                    ));
                    progress.advance(source_id, 1);
                }
            }
        }
        batch.sort_by_key(|r| r.iteration);
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QueryError, QueryErrorKind};
    use crate::orchestrator::QueryCounter;
    use async_trait::async_trait;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Scripted capability: answers from a closure and records every call.
    struct Scripted<F> {
        answer: F,
        calls: AtomicUsize,
        budgets: DashMap<String, Vec<u32>>,
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
    }

    impl<F> Scripted<F>
    where
        F: Fn(&str, usize) -> std::result::Result<RawReply, QueryError> + Send + Sync,
    {
        fn new(answer: F) -> Arc<Self> {
            Arc::new(Self {
                answer,
                calls: AtomicUsize::new(0),
                budgets: DashMap::new(),
                in_flight: AtomicU32::new(0),
                max_in_flight: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl<F> QueryCapability for Scripted<F>
    where
        F: Fn(&str, usize) -> std::result::Result<RawReply, QueryError> + Send + Sync,
    {
        async fn query(
            &self,
            source_id: &str,
            _prompt: &str,
            params: &QueryParams,
        ) -> std::result::Result<RawReply, QueryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.budgets
                .entry(source_id.to_string())
                .or_default()
                .push(params.max_output_tokens);

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            (self.answer)(source_id, n)
        }
    }

    fn config() -> QueryConfig {
        QueryConfig {
            rate_limit_delay_secs: 0.0,
            ..Default::default()
        }
    }

    fn sources(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn answer(p: u32) -> RawReply {
        RawReply::text(format!("After weighing the evidence carefully.\n\nPROGNOSE: {p}%"))
    }

    #[tokio::test]
    async fn test_always_failing_capability_yields_one_error_per_query() {
        let capability = Scripted::new(|_: &str, _| {
            Err(QueryError::from_status(503, "upstream unavailable"))
        });
        let orchestrator = QueryOrchestrator::new(capability, None, config());
        let counter = Arc::new(QueryCounter::new());

        let ids = sources(&["a/model", "b/model:free", "c/model"]);
        let replies = orchestrator
            .run(&ids, "prompt", 4, counter.clone(), &CancelFlag::new())
            .await;

        assert_eq!(replies.len(), 12);
        assert!(replies.iter().all(|r| r.status == ReplyStatus::Error));
        assert!(replies.iter().all(|r| r.probability.is_none() && r.error.is_some()));
        assert_eq!(counter.total(), 12);
        assert_eq!(counter.for_source("b/model:free"), 4);
    }

    #[tokio::test]
    async fn test_error_kinds_map_to_statuses() {
        let capability = Scripted::new(|source: &str, _| match source {
            "limited" => Err(QueryError::from_status(429, "slow down")),
            "missing" => Err(QueryError::from_status(404, "no such model")),
            "bad" => Err(QueryError::from_status(400, "bad request")),
            _ => Err(QueryError::timeout("upstream timeout")),
        });
        let orchestrator = QueryOrchestrator::new(capability, None, config());
        let replies = orchestrator
            .run(
                &sources(&["limited", "missing", "bad", "slow"]),
                "p",
                1,
                Arc::new(QueryCounter::new()),
                &CancelFlag::new(),
            )
            .await;

        let statuses: Vec<ReplyStatus> = replies.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ReplyStatus::RateLimited,
                ReplyStatus::NotFound,
                ReplyStatus::InvalidModel,
                ReplyStatus::Timeout
            ]
        );
    }

    #[tokio::test]
    async fn test_iterations_numbered_and_probabilities_extracted() {
        let capability = Scripted::new(|_: &str, n| Ok(answer(30 + n as u32)));
        let orchestrator = QueryOrchestrator::new(capability, None, config());
        let replies = orchestrator
            .run(&sources(&["a"]), "p", 5, Arc::new(QueryCounter::new()), &CancelFlag::new())
            .await;

        let iterations: Vec<u32> = replies.iter().map(|r| r.iteration).collect();
        assert_eq!(iterations, vec![1, 2, 3, 4, 5]);
        assert!(replies.iter().all(|r| r.status == ReplyStatus::Success));
        assert!(replies
            .iter()
            .all(|r| r.probability.is_some_and(|p| (30.0..35.0).contains(&p))));
        assert_eq!(replies[0].ensemble_id(), "a_01");
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let capability = Scripted::new(|_: &str, _| Ok(answer(50)));
        let orchestrator = QueryOrchestrator::new(
            capability.clone(),
            None,
            QueryConfig {
                concurrency: 2,
                ..config()
            },
        );
        orchestrator
            .run(&sources(&["a"]), "p", 8, Arc::new(QueryCounter::new()), &CancelFlag::new())
            .await;

        assert_eq!(capability.calls.load(Ordering::SeqCst), 8);
        assert!(capability.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_rate_limited_source_is_sequential_and_retries_empty_once() {
        // Every reply from the free source is empty
        let capability = Scripted::new(|source: &str, _| {
            if source.ends_with(":free") {
                Ok(RawReply::text("   "))
            } else {
                Ok(answer(40))
            }
        });
        let orchestrator = QueryOrchestrator::new(capability.clone(), None, config());
        let counter = Arc::new(QueryCounter::new());
        let replies = orchestrator
            .run(
                &sources(&["meta-llama/llama-3:free"]),
                "p",
                3,
                counter.clone(),
                &CancelFlag::new(),
            )
            .await;

        assert_eq!(replies.len(), 3);
        assert!(replies.iter().all(|r| r.status == ReplyStatus::EmptyResponse));
        // One retry per empty reply, progress advanced once per query
        assert_eq!(capability.calls.load(Ordering::SeqCst), 6);
        assert_eq!(counter.total(), 3);
        assert_eq!(capability.max_in_flight.load(Ordering::SeqCst), 1);

        // llama floor 6000 first, then the retry budget
        let budgets = capability.budgets.get("meta-llama/llama-3:free").unwrap().clone();
        assert_eq!(budgets, vec![6000, 10000, 6000, 10000, 6000, 10000]);
    }

    #[tokio::test]
    async fn test_empty_reply_from_regular_source_is_not_retried() {
        let capability = Scripted::new(|_: &str, _| Ok(RawReply::default()));
        let orchestrator = QueryOrchestrator::new(capability.clone(), None, config());
        let replies = orchestrator
            .run(&sources(&["openai/gpt-4o"]), "p", 2, Arc::new(QueryCounter::new()), &CancelFlag::new())
            .await;
        assert!(replies.iter().all(|r| r.status == ReplyStatus::EmptyResponse));
        assert_eq!(capability.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refusal_is_rejected() {
        let capability = Scripted::new(|_: &str, _| {
            Ok(RawReply::text("I'm sorry, but I must decline this request. PROGNOSE: 50%"))
        });
        let orchestrator = QueryOrchestrator::new(capability, None, config());
        let replies = orchestrator
            .run(&sources(&["a"]), "p", 1, Arc::new(QueryCounter::new()), &CancelFlag::new())
            .await;
        assert_eq!(replies[0].status, ReplyStatus::Rejected);
        assert_eq!(replies[0].probability, None);
    }

    #[tokio::test]
    async fn test_successes_are_cached_and_reused() {
        let store = Arc::new(ReplyStore::in_memory(Duration::from_secs(3600)).unwrap());
        let capability = Scripted::new(|source: &str, _| {
            if source == "broken" {
                Err(QueryError::new(QueryErrorKind::Other, "boom"))
            } else {
                Ok(answer(25))
            }
        });
        let orchestrator =
            QueryOrchestrator::new(capability.clone(), Some(store.clone()), config());
        let ids = sources(&["a", "broken"]);

        let first = orchestrator
            .run(&ids, "p", 1, Arc::new(QueryCounter::new()), &CancelFlag::new())
            .await;
        assert!(!first[0].from_cache);
        assert_eq!(store.statistics().unwrap().active_entries, 1);

        let second = orchestrator
            .run(&ids, "p", 1, Arc::new(QueryCounter::new()), &CancelFlag::new())
            .await;
        assert!(second[0].from_cache);
        assert_eq!(second[0].probability, Some(25.0));
        assert_eq!(second[1].status, ReplyStatus::Error);
        // a: 1 call, broken: 2 calls
        assert_eq!(capability.calls.load(Ordering::SeqCst), 3);

        let refreshing = QueryOrchestrator::new(
            capability.clone(),
            Some(store),
            QueryConfig {
                force_refresh: true,
                ..config()
            },
        );
        let third = refreshing
            .run(&sources(&["a"]), "p", 1, Arc::new(QueryCounter::new()), &CancelFlag::new())
            .await;
        assert!(!third[0].from_cache);
        assert_eq!(capability.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_on_disk_cache_shared_across_orchestrators() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replies.db");
        let ttl = Duration::from_secs(3600);
        let capability = Scripted::new(|_: &str, n| Ok(answer(40 + n as u32)));
        let ids = sources(&["a", "b", "c"]);

        let writer = QueryOrchestrator::new(
            capability.clone(),
            Some(Arc::new(ReplyStore::open(&path, ttl).unwrap())),
            config(),
        );
        let first = writer
            .run(&ids, "p", 1, Arc::new(QueryCounter::new()), &CancelFlag::new())
            .await;
        assert!(first.iter().all(|r| !r.from_cache));
        drop(writer);

        let reader = QueryOrchestrator::new(
            capability.clone(),
            Some(Arc::new(ReplyStore::open(&path, ttl).unwrap())),
            config(),
        );
        let second = reader
            .run(&ids, "p", 1, Arc::new(QueryCounter::new()), &CancelFlag::new())
            .await;
        assert!(second.iter().all(|r| r.from_cache));
        for (before, after) in first.iter().zip(&second) {
            assert_eq!(before.probability, after.probability);
        }
        assert_eq!(capability.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_timeout_reply() {
        struct Hanging;
        #[async_trait]
        impl QueryCapability for Hanging {
            async fn query(
                &self,
                _: &str,
                _: &str,
                _: &QueryParams,
            ) -> std::result::Result<RawReply, QueryError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(RawReply::default())
            }
        }

        let orchestrator = QueryOrchestrator::new(
            Arc::new(Hanging),
            None,
            QueryConfig {
                query_timeout_secs: 1,
                ..config()
            },
        );
        let replies = orchestrator
            .run(&sources(&["a"]), "p", 2, Arc::new(QueryCounter::new()), &CancelFlag::new())
            .await;
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|r| r.status == ReplyStatus::Timeout));
    }

    #[tokio::test]
    async fn test_cancelled_batch_stops_between_sources() {
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        let capability = Scripted::new(move |_: &str, _| {
            trigger.cancel();
            Ok(answer(60))
        });
        let orchestrator = QueryOrchestrator::new(capability, None, config());
        let replies = orchestrator
            .run(&sources(&["a", "b", "c"]), "p", 3, Arc::new(QueryCounter::new()), &cancel)
            .await;

        // The first source finishes; nothing after it starts
        assert_eq!(replies.len(), 3);
        assert!(replies.iter().all(|r| r.source_id == "a"));
    }
}
