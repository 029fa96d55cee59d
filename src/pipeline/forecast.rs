//! Forecast pipeline.
//!
//! Pipeline flow:
//! Prompt → QueryOrchestrator (cache, throttle) → Replies → ForecastAggregator → ForecastRun

use crate::analysis::ForecastAggregator;
use crate::cache::ReplyStore;
use crate::client::{LLMClient, QueryCapability};
use crate::models::{
    AugurError, Config, EnsembleStatistics, MAX_ITERATIONS, Reply, Result,
};
use crate::orchestrator::{CancelFlag, ProgressSink, QueryOrchestrator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Record of one forecast batch: inputs, every reply, and the aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub prompt: String,
    pub sources: Vec<String>,
    pub iterations: u32,
    /// True when the batch was interrupted before all sources ran
    #[serde(default)]
    pub cancelled: bool,
    pub replies: Vec<Reply>,
    /// None when no reply carried a usable probability
    #[serde(default)]
    pub statistics: Option<EnsembleStatistics>,
}

impl ForecastRun {
    /// Load a run record from JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| AugurError::io("opening run record", e))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| AugurError::ParseError(format!("Invalid run record: {}", e)))
    }

    /// Write the record as pretty JSON, atomically (write-then-rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| AugurError::io("creating output directory", e))?;
        }

        let temp_path = path.with_extension("json.tmp");
        {
            let file = File::create(&temp_path)
                .map_err(|e| AugurError::io("creating temp run record", e))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, self)?;
            writer
                .flush()
                .map_err(|e| AugurError::io("flushing run record", e))?;
        }

        fs::rename(&temp_path, path).map_err(|e| AugurError::io("renaming run record", e))?;
        info!(path = %path.display(), "Run record saved");
        Ok(())
    }

    /// Default file name inside an output directory.
    pub fn file_name(&self) -> String {
        format!("forecast_{}_{}.json", self.started_at.format("%Y%m%d_%H%M%S"), self.id.simple())
    }

    /// Recompute `statistics` from the stored replies.
    pub fn reaggregate(&mut self, aggregator: &mut ForecastAggregator) -> Result<()> {
        self.statistics = aggregate_or_none(aggregator, &self.replies)?;
        Ok(())
    }
}

/// Aggregate, treating "no usable probability" as an empty result.
fn aggregate_or_none(
    aggregator: &mut ForecastAggregator,
    replies: &[Reply],
) -> Result<Option<EnsembleStatistics>> {
    match aggregator.aggregate(replies) {
        Ok(stats) => Ok(Some(stats)),
        Err(AugurError::InsufficientData { total_replies }) => {
            warn!(total_replies, "No usable probabilities, skipping aggregation");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// End-to-end forecast pipeline.
pub struct ForecastPipeline {
    orchestrator: QueryOrchestrator,
    store: Option<Arc<ReplyStore>>,
    /// Kept across runs so Bayesian history accumulates
    aggregator: Mutex<ForecastAggregator>,
}

impl ForecastPipeline {
    pub fn new(
        config: &Config,
        capability: Arc<dyn QueryCapability>,
        store: Option<Arc<ReplyStore>>,
    ) -> Self {
        Self {
            orchestrator: QueryOrchestrator::new(
                capability,
                store.clone(),
                config.query.clone(),
            ),
            store,
            aggregator: Mutex::new(ForecastAggregator::new(config.aggregation.clone())),
        }
    }

    /// Build the HTTP client and, when enabled, the on-disk cache.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = Arc::new(LLMClient::from_config(config)?);
        let store = if config.cache.enabled {
            Some(Arc::new(ReplyStore::from_config(&config.cache)?))
        } else {
            None
        };
        Ok(Self::new(config, client, store))
    }

    pub fn store(&self) -> Option<&Arc<ReplyStore>> {
        self.store.as_ref()
    }

    /// Query every source and aggregate whatever came back.
    ///
    /// B_i(prompt non-empty, sources non-empty, 1 <= iterations <= 100) → InvalidInput otherwise
    pub async fn run(
        &self,
        prompt: &str,
        sources: &[String],
        iterations: u32,
        progress: Arc<dyn ProgressSink>,
        cancel: &CancelFlag,
    ) -> Result<ForecastRun> {
        if prompt.trim().is_empty() {
            return Err(AugurError::InvalidInput("prompt is empty".to_string()));
        }
        if sources.is_empty() {
            return Err(AugurError::InvalidInput("no sources given".to_string()));
        }
        if !(1..=MAX_ITERATIONS).contains(&iterations) {
            return Err(AugurError::InvalidInput(format!(
                "iterations must be between 1 and {}, got {}",
                MAX_ITERATIONS, iterations
            )));
        }

        let start = Instant::now();
        let started_at = Utc::now();
        info!(
            sources = sources.len(),
            iterations,
            total_queries = sources.len() * iterations as usize,
            "Starting forecast batch"
        );

        let replies = self
            .orchestrator
            .run(sources, prompt, iterations, progress, cancel)
            .await;

        let statistics = {
            let mut aggregator = self
                .aggregator
                .lock()
                .map_err(|_| AugurError::Internal("Aggregator lock poisoned".to_string()))?;
            aggregate_or_none(&mut aggregator, &replies)?
        };

        let run = ForecastRun {
            id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            prompt: prompt.to_string(),
            sources: sources.to_vec(),
            iterations,
            cancelled: cancel.is_cancelled(),
            replies,
            statistics,
        };

        info!(
            replies = run.replies.len(),
            cancelled = run.cancelled,
            duration_secs = start.elapsed().as_secs_f64(),
            "Forecast batch complete"
        );
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::QueryParams;
    use crate::models::{QueryError, RawReply, RecommendedMethod, ReplyStatus};
    use crate::orchestrator::QueryCounter;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Answers with a fixed probability per source; unknown sources 404.
    struct Panel;

    #[async_trait]
    impl QueryCapability for Panel {
        async fn query(
            &self,
            source_id: &str,
            _prompt: &str,
            _params: &QueryParams,
        ) -> std::result::Result<RawReply, QueryError> {
            let p = match source_id {
                "alpha/model" => 30,
                "beta/model" => 34,
                "gamma/model" => 38,
                _ => return Err(QueryError::from_status(404, "No endpoints found")),
            };
            Ok(RawReply::text(format!(
                "Considering base rates and recent news.\n\nPROGNOSE: {p}%"
            )))
        }
    }

    /// Two sources near 30 and one near 85, each wobbling by a point across calls.
    #[derive(Default)]
    struct SplitPanel {
        calls: std::sync::Mutex<std::collections::HashMap<String, usize>>,
    }

    #[async_trait]
    impl QueryCapability for SplitPanel {
        async fn query(
            &self,
            source_id: &str,
            _prompt: &str,
            _params: &QueryParams,
        ) -> std::result::Result<RawReply, QueryError> {
            let centre = match source_id {
                "a/model" => 30,
                "b/model" => 32,
                "c/model" => 85,
                _ => return Err(QueryError::from_status(404, "No endpoints found")),
            };
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(source_id.to_string()).or_insert(0);
                *n += 1;
                *n
            };
            let wobble = [-1, 0, 1, 0, 0][(call - 1) % 5];
            Ok(RawReply::text(format!(
                "Weighing the evidence.\n\nPROGNOSE: {}%",
                centre + wobble
            )))
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.query.rate_limit_delay_secs = 0.0;
        config
    }

    fn sources(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_run_end_to_end() {
        let store = Arc::new(ReplyStore::in_memory(Duration::from_secs(3600)).unwrap());
        let pipeline = ForecastPipeline::new(&config(), Arc::new(Panel), Some(store));
        let counter = Arc::new(QueryCounter::new());

        let run = pipeline
            .run(
                "Will it happen?",
                &sources(&["alpha/model", "beta/model", "gamma/model", "missing/model"]),
                3,
                counter.clone(),
                &CancelFlag::new(),
            )
            .await
            .unwrap();

        assert_eq!(run.replies.len(), 12);
        assert_eq!(counter.total(), 12);
        assert!(!run.cancelled);

        let stats = run.statistics.as_ref().unwrap();
        assert_eq!(stats.total_queries, 12);
        assert_eq!(stats.successful_queries, 9);
        assert_eq!(stats.status_counts.get("not_found"), Some(&3));
        assert!((stats.methods.simple_mean - 34.0).abs() < 1e-9);
        assert!(stats.methods.recommended_estimate > 29.0 && stats.methods.recommended_estimate < 39.0);
        assert!(pipeline.store().unwrap().statistics().unwrap().active_entries > 0);
    }

    #[tokio::test]
    async fn test_run_without_probabilities_has_no_statistics() {
        let pipeline = ForecastPipeline::new(&config(), Arc::new(Panel), None);
        let run = pipeline
            .run(
                "Will it happen?",
                &sources(&["missing/model"]),
                2,
                Arc::new(QueryCounter::new()),
                &CancelFlag::new(),
            )
            .await
            .unwrap();

        assert!(run.statistics.is_none());
        assert!(run.replies.iter().all(|r| r.status == ReplyStatus::NotFound));
    }

    #[tokio::test]
    async fn test_run_rejects_bad_input() {
        let pipeline = ForecastPipeline::new(&config(), Arc::new(Panel), None);
        let counter: Arc<dyn ProgressSink> = Arc::new(QueryCounter::new());
        let cancel = CancelFlag::new();
        let ids = sources(&["alpha/model"]);

        let empty = pipeline.run("  ", &ids, 1, counter.clone(), &cancel).await;
        assert!(matches!(empty, Err(AugurError::InvalidInput(_))));

        let none = pipeline.run("p", &[], 1, counter.clone(), &cancel).await;
        assert!(matches!(none, Err(AugurError::InvalidInput(_))));

        let zero = pipeline.run("p", &ids, 0, counter.clone(), &cancel).await;
        assert!(matches!(zero, Err(AugurError::InvalidInput(_))));

        let many = pipeline.run("p", &ids, 101, counter, &cancel).await;
        assert!(matches!(many, Err(AugurError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let pipeline = ForecastPipeline::new(&config(), Arc::new(Panel), None);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let run = pipeline
            .run("p", &sources(&["alpha/model"]), 2, Arc::new(QueryCounter::new()), &cancel)
            .await
            .unwrap();
        assert!(run.cancelled);
        assert!(run.replies.is_empty());
        assert!(run.statistics.is_none());
    }

    #[tokio::test]
    async fn test_save_load_and_reaggregate() {
        let pipeline = ForecastPipeline::new(&config(), Arc::new(Panel), None);
        let run = pipeline
            .run(
                "Will it happen?",
                &sources(&["alpha/model", "beta/model"]),
                2,
                Arc::new(QueryCounter::new()),
                &CancelFlag::new(),
            )
            .await
            .unwrap();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs").join(run.file_name());
        run.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let mut loaded = ForecastRun::load(&path).unwrap();
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.replies.len(), 4);
        assert_eq!(loaded.replies[0].probability, Some(30.0));

        loaded.statistics = None;
        let mut aggregator = ForecastAggregator::new(config().aggregation);
        loaded.reaggregate(&mut aggregator).unwrap();
        let stats = loaded.statistics.unwrap();
        assert!((stats.methods.simple_mean - 32.0).abs() < 1e-9);
        assert_eq!(stats.methods.recommended_method, RecommendedMethod::ConsistencyWeighted);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(ForecastRun::load(&path), Err(AugurError::ParseError(_))));
        assert!(matches!(
            ForecastRun::load(&dir.path().join("missing.json")),
            Err(AugurError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_outlying_source_is_discounted_end_to_end() {
        let pipeline = ForecastPipeline::new(&config(), Arc::new(SplitPanel::default()), None);
        let run = pipeline
            .run(
                "Will it happen?",
                &sources(&["a/model", "b/model", "c/model"]),
                5,
                Arc::new(QueryCounter::new()),
                &CancelFlag::new(),
            )
            .await
            .unwrap();

        assert_eq!(run.replies.len(), 15);
        let stats = run.statistics.as_ref().unwrap();
        assert_eq!(stats.valid_probabilities, 15);

        let m = &stats.methods;
        let cluster = 31.0;
        let bayesian = m.bayesian_mean.unwrap();
        assert!(m.outliers_detected > 0);
        assert!((bayesian - cluster).abs() < (m.simple_mean - cluster).abs());
        assert!(m.recommended_estimate < m.simple_mean);
        assert!(stats.sources["c/model"].bayesian_weight < stats.sources["a/model"].bayesian_weight);
    }
}
