//! Configuration models for augur.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file; every
//! heuristic constant of the aggregation stages is a field with a default.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for augur.
///
/// I^R resolved: All configurable parameters are explicit. Every section
/// has defaults, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// OpenRouter API configuration
    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// Query orchestration settings
    #[serde(default)]
    pub query: QueryConfig,

    /// Reply cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Statistical aggregation settings
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Default batch shape
    #[serde(default)]
    pub forecast: ForecastConfig,
}

/// OpenRouter API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// API key (can also be set via OPENROUTER_API_KEY env var)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name for API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL for OpenRouter API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum attempts per query (network errors and 429s)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

/// Minimum output-length budget for sources whose id contains `pattern`.
///
/// K_i: Some sources truncate their answer at low budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFloor {
    pub pattern: String,
    pub min_tokens: u32,
}

impl OutputFloor {
    fn new(pattern: &str, min_tokens: u32) -> Self {
        Self {
            pattern: pattern.to_string(),
            min_tokens,
        }
    }
}

/// Query orchestration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Maximum in-flight queries to non-rate-limited sources
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Source-id substrings marking a source as rate-limited (sequential)
    #[serde(default = "default_rate_limited_markers")]
    pub rate_limited_markers: Vec<String>,

    /// Delay before every iteration after the first on rate-limited sources
    #[serde(default = "default_rate_limit_delay")]
    pub rate_limit_delay_secs: f64,

    /// Deadline for a single query
    #[serde(default = "default_timeout")]
    pub query_timeout_secs: u64,

    /// Requested output-length budget
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Budget for the single retry after an empty reply
    #[serde(default = "default_retry_output_tokens")]
    pub retry_output_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Ask the provider to ground answers with web search
    #[serde(default = "default_true")]
    pub web_search: bool,

    /// Replies shorter than this are empty
    #[serde(default = "default_min_reply_chars")]
    pub min_reply_chars: usize,

    /// Bypass cache lookups (successful replies are still written)
    #[serde(default)]
    pub force_refresh: bool,

    /// Output-length floors; first matching pattern wins
    #[serde(default = "default_output_floors")]
    pub output_floors: Vec<OutputFloor>,
}

fn default_concurrency() -> usize {
    3
}

fn default_rate_limited_markers() -> Vec<String> {
    vec![":free".to_string()]
}

fn default_rate_limit_delay() -> f64 {
    3.0
}

fn default_max_output_tokens() -> u32 {
    4000
}

fn default_retry_output_tokens() -> u32 {
    10_000
}

fn default_temperature() -> f64 {
    0.7
}

fn default_true() -> bool {
    true
}

fn default_min_reply_chars() -> usize {
    10
}

fn default_output_floors() -> Vec<OutputFloor> {
    vec![
        OutputFloor::new("gemini", 8000),
        OutputFloor::new("gemma", 8000),
        OutputFloor::new("gpt-5", 4000),
        OutputFloor::new("qwen-2.5-72b", 10_000),
        OutputFloor::new("qwen", 8000),
        OutputFloor::new("qwq", 8000),
        OutputFloor::new("deepseek", 8000),
        OutputFloor::new("grok", 8000),
        OutputFloor::new("llama-4-maverick", 8000),
        OutputFloor::new("llama", 6000),
        OutputFloor::new(":free", 6000),
    ]
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            rate_limited_markers: default_rate_limited_markers(),
            rate_limit_delay_secs: default_rate_limit_delay(),
            query_timeout_secs: default_timeout(),
            max_output_tokens: default_max_output_tokens(),
            retry_output_tokens: default_retry_output_tokens(),
            temperature: default_temperature(),
            web_search: true,
            min_reply_chars: default_min_reply_chars(),
            force_refresh: false,
            output_floors: default_output_floors(),
        }
    }
}

impl QueryConfig {
    /// Whether a source must be queried sequentially with a delay.
    pub fn is_rate_limited(&self, source_id: &str) -> bool {
        self.rate_limited_markers
            .iter()
            .any(|m| source_id.contains(m.as_str()))
    }

    /// Output budget for a source: never below its floor, never below `requested`.
    pub fn output_budget(&self, source_id: &str, requested: u32) -> u32 {
        let id = source_id.to_lowercase();
        self.output_floors
            .iter()
            .find(|f| id.contains(&f.pattern.to_lowercase()))
            .map_or(requested, |f| requested.max(f.min_tokens))
    }
}

/// Reply cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// SQLite database path
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,

    /// Entry lifetime in hours
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("cache/replies.db")
}

fn default_ttl_hours() -> u64 {
    168
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_cache_path(),
            ttl_hours: default_ttl_hours(),
        }
    }
}

/// Strategy for scoring a source's self-consistency.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMethod {
    /// 1 / (1 + coefficient of variation)
    InverseCv,
    /// One minus normalized entropy of a 10-bin histogram
    Entropy,
    /// Mean of inverse-stdev, inverse-range and inverse-IQR scores (default)
    #[default]
    Blend,
}

/// Consistency scoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    #[serde(default)]
    pub method: ConsistencyMethod,

    /// Exponent applied to consistency when weighting source means
    #[serde(default = "default_weighting_exponent")]
    pub weighting_exponent: f64,

    /// Exponent for normalized per-source confidence weights
    #[serde(default = "default_confidence_exponent")]
    pub confidence_exponent: f64,
}

fn default_weighting_exponent() -> f64 {
    2.0
}

fn default_confidence_exponent() -> f64 {
    1.5
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            method: ConsistencyMethod::default(),
            weighting_exponent: default_weighting_exponent(),
            confidence_exponent: default_confidence_exponent(),
        }
    }
}

/// Post-hoc calibration mapping used when outcomes are known.
///
/// K_i: Without outcomes every method falls back to temperature scaling
/// estimated from batch variance.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMethod {
    #[default]
    Temperature,
    Platt,
    Isotonic,
}

/// Calibration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default)]
    pub method: CalibrationMethod,

    /// Size of sorted batches for variance estimation
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Within-batch variance (probability scale) considered well calibrated
    #[serde(default = "default_baseline_variance")]
    pub baseline_variance: f64,

    /// Temperature increase per unit of excess variance
    #[serde(default = "default_variance_gain")]
    pub variance_gain: f64,

    #[serde(default = "default_min_temperature")]
    pub min_temperature: f64,

    #[serde(default = "default_max_temperature")]
    pub max_temperature: f64,
}

fn default_batch_size() -> usize {
    10
}

fn default_baseline_variance() -> f64 {
    0.01
}

fn default_variance_gain() -> f64 {
    10.0
}

fn default_min_temperature() -> f64 {
    0.5
}

fn default_max_temperature() -> f64 {
    2.0
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            method: CalibrationMethod::default(),
            batch_size: default_batch_size(),
            baseline_variance: default_baseline_variance(),
            variance_gain: default_variance_gain(),
            min_temperature: default_min_temperature(),
            max_temperature: default_max_temperature(),
        }
    }
}

/// Robust Bayesian pooling configuration.
///
/// I^R: These constants are tuning heuristics without a derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BayesianConfig {
    /// Beta prior pseudo-count on each side
    #[serde(default = "default_prior_strength")]
    pub prior_strength: f64,

    /// Modified z-score above which a sample is an outlier
    #[serde(default = "default_outlier_threshold")]
    pub outlier_threshold: f64,

    /// Pseudo-observations contributed by the full weight mass
    #[serde(default = "default_virtual_sample_size")]
    pub virtual_sample_size: f64,

    /// Weight multiplier for outliers
    #[serde(default = "default_outlier_penalty")]
    pub outlier_penalty: f64,

    #[serde(default = "default_consensus_iterations")]
    pub consensus_iterations: usize,

    /// Slope of the 1 / (1 + k * |x - mean|) disagreement penalty
    #[serde(default = "default_disagreement_penalty")]
    pub disagreement_penalty: f64,

    /// Past errors kept per source
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

fn default_prior_strength() -> f64 {
    1.0
}

fn default_outlier_threshold() -> f64 {
    2.5
}

fn default_virtual_sample_size() -> f64 {
    10.0
}

fn default_outlier_penalty() -> f64 {
    0.1
}

fn default_consensus_iterations() -> usize {
    3
}

fn default_disagreement_penalty() -> f64 {
    5.0
}

fn default_history_window() -> usize {
    20
}

impl Default for BayesianConfig {
    fn default() -> Self {
        Self {
            prior_strength: default_prior_strength(),
            outlier_threshold: default_outlier_threshold(),
            virtual_sample_size: default_virtual_sample_size(),
            outlier_penalty: default_outlier_penalty(),
            consensus_iterations: default_consensus_iterations(),
            disagreement_penalty: default_disagreement_penalty(),
            history_window: default_history_window(),
        }
    }
}

/// Aggregation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default)]
    pub consistency: ConsistencyConfig,

    #[serde(default)]
    pub calibration: CalibrationConfig,

    #[serde(default)]
    pub bayesian: BayesianConfig,

    /// Ensemble consistency above which the consistency-weighted mean is recommended
    #[serde(default = "default_consistency_threshold")]
    pub consistency_threshold: f64,

    /// Bayesian uncertainty above which the Bayesian mean is recommended
    #[serde(default = "default_uncertainty_threshold")]
    pub uncertainty_threshold: f64,

    /// Sample count at which the sample-size confidence factor saturates
    #[serde(default = "default_sample_saturation")]
    pub sample_saturation: usize,

    /// Rule used to flag individual outlying replies
    #[serde(default)]
    pub outlier_method: OutlierMethod,
}

/// How individual replies are flagged as outliers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutlierMethod {
    /// Outside 1.5 IQR beyond the quartiles (default)
    #[default]
    Iqr,
    /// Absolute z-score above 2.5
    ZScore,
}

fn default_consistency_threshold() -> f64 {
    0.8
}

fn default_uncertainty_threshold() -> f64 {
    0.5
}

fn default_sample_saturation() -> usize {
    50
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            consistency: ConsistencyConfig::default(),
            calibration: CalibrationConfig::default(),
            bayesian: BayesianConfig::default(),
            consistency_threshold: default_consistency_threshold(),
            uncertainty_threshold: default_uncertainty_threshold(),
            sample_saturation: default_sample_saturation(),
            outlier_method: OutlierMethod::default(),
        }
    }
}

/// Default batch shape for the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// Source identifiers to query
    #[serde(default)]
    pub sources: Vec<String>,

    /// Iterations per source (1..=100)
    #[serde(default = "default_iterations")]
    pub iterations: u32,

    /// Directory for run records
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_iterations() -> u32 {
    10
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            iterations: default_iterations(),
            output_dir: default_output_dir(),
        }
    }
}

/// Upper bound on iterations per source.
pub const MAX_ITERATIONS: u32 = 100;

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve API key from config or environment.
    ///
    /// B_i(api key available) → Result
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = &self.openrouter.api_key {
            return Ok(expand_env_vars(key));
        }

        std::env::var(&self.openrouter.api_key_env).map_err(|_| ConfigError::MissingApiKey {
            env_var: self.openrouter.api_key_env.clone(),
        })
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: &str| {
            Err(ConfigError::Invalid {
                field: field.to_string(),
                reason: reason.to_string(),
            })
        };

        if !(1..=MAX_ITERATIONS).contains(&self.forecast.iterations) {
            return invalid("forecast.iterations", "must be between 1 and 100");
        }
        if self.query.concurrency == 0 {
            return invalid("query.concurrency", "must be at least 1");
        }
        if self.query.rate_limit_delay_secs < 0.0 || !self.query.rate_limit_delay_secs.is_finite() {
            return invalid("query.rate_limit_delay_secs", "must be a non-negative number");
        }
        if self.query.query_timeout_secs == 0 {
            return invalid("query.query_timeout_secs", "must be positive");
        }
        if self.openrouter.max_retries == 0 {
            return invalid("openrouter.max_retries", "must be at least 1");
        }
        if self.cache.ttl_hours == 0 {
            return invalid("cache.ttl_hours", "must be positive");
        }

        let cal = &self.aggregation.calibration;
        if cal.batch_size == 0 {
            return invalid("aggregation.calibration.batch_size", "must be at least 1");
        }
        if !(cal.min_temperature > 0.0 && cal.min_temperature <= cal.max_temperature) {
            return invalid(
                "aggregation.calibration",
                "temperatures must satisfy 0 < min_temperature <= max_temperature",
            );
        }

        let bayes = &self.aggregation.bayesian;
        if bayes.prior_strength <= 0.0 {
            return invalid("aggregation.bayesian.prior_strength", "must be positive");
        }
        if bayes.virtual_sample_size <= 0.0 {
            return invalid("aggregation.bayesian.virtual_sample_size", "must be positive");
        }
        if bayes.outlier_threshold <= 0.0 {
            return invalid("aggregation.bayesian.outlier_threshold", "must be positive");
        }
        if !(0.0..=1.0).contains(&bayes.outlier_penalty) {
            return invalid("aggregation.bayesian.outlier_penalty", "must be within [0, 1]");
        }
        if bayes.history_window == 0 {
            return invalid("aggregation.bayesian.history_window", "must be at least 1");
        }

        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return s.to_string();
    };

    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        if let Ok(value) = std::env::var(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }
    result
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error, out-of-range value
/// - I^B materialized: Missing required values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing API key: set {env_var} env var or openrouter.api_key in config")]
    MissingApiKey { env_var: String },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.query.concurrency, 3);
        assert_eq!(config.cache.ttl_hours, 168);
        assert_eq!(config.forecast.iterations, 10);
        assert_eq!(config.aggregation.bayesian.history_window, 20);
        assert_eq!(config.aggregation.consistency.method, ConsistencyMethod::Blend);
        assert_eq!(config.aggregation.outlier_method, OutlierMethod::Iqr);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            [query]
            concurrency = 8
            rate_limited_markers = [":free", "-trial"]

            [aggregation]
            outlier_method = "z_score"

            [aggregation.bayesian]
            outlier_threshold = 3.0

            [aggregation.calibration]
            method = "isotonic"
            "#,
        )
        .unwrap();

        assert_eq!(config.query.concurrency, 8);
        assert_eq!(config.query.max_output_tokens, 4000);
        assert!(config.query.is_rate_limited("acme/model-trial"));
        assert_eq!(config.aggregation.bayesian.outlier_threshold, 3.0);
        assert_eq!(config.aggregation.bayesian.prior_strength, 1.0);
        assert_eq!(
            config.aggregation.calibration.method,
            CalibrationMethod::Isotonic
        );
        assert_eq!(config.aggregation.outlier_method, OutlierMethod::ZScore);
        assert_eq!(config.aggregation.consistency_threshold, 0.8);
    }

    #[test]
    fn test_output_budget_floors() {
        let q = QueryConfig::default();
        assert_eq!(q.output_budget("google/gemini-2.5-pro", 4000), 8000);
        assert_eq!(q.output_budget("qwen/qwen-2.5-72b-instruct", 4000), 10_000);
        assert_eq!(q.output_budget("qwen/qwq-32b", 4000), 8000);
        assert_eq!(q.output_budget("meta-llama/llama-3.3-70b", 4000), 6000);
        assert_eq!(q.output_budget("meta-llama/llama-4-maverick", 4000), 8000);
        assert_eq!(q.output_budget("mistral/small:free", 4000), 6000);
        assert_eq!(q.output_budget("anthropic/claude-sonnet-4", 4000), 4000);
        // A floor never lowers a larger request
        assert_eq!(q.output_budget("deepseek/deepseek-r1", 12_000), 12_000);
    }

    #[test]
    fn test_rate_limited_marker() {
        let q = QueryConfig::default();
        assert!(q.is_rate_limited("deepseek/deepseek-r1:free"));
        assert!(!q.is_rate_limited("deepseek/deepseek-r1"));
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let mut config = Config::default();
        config.forecast.iterations = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "forecast.iterations"
        ));

        let mut config = Config::default();
        config.forecast.iterations = 101;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.aggregation.bayesian.prior_strength = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.aggregation.calibration.min_temperature = 3.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[forecast]\nsources = [\"a/b\", \"c/d:free\"]\niterations = 5").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.forecast.sources, vec!["a/b", "c/d:free"]);
        assert_eq!(config.forecast.iterations, 5);
    }

    #[test]
    fn test_from_file_errors() {
        let missing = Config::from_file(std::path::Path::new("/nonexistent/augur.toml"));
        assert!(matches!(missing, Err(ConfigError::FileRead { .. })));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[query\nconcurrency = ").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_explicit_api_key_wins() {
        let mut config = Config::default();
        config.openrouter.api_key = Some("sk-test".to_string());
        assert_eq!(config.resolve_api_key().unwrap(), "sk-test");
    }

    #[test]
    fn test_expand_env_vars_keeps_unset_placeholder() {
        let s = "Bearer ${AUGUR_TEST_VARIABLE_THAT_IS_NOT_SET}";
        assert_eq!(expand_env_vars(s), s);
        assert_eq!(expand_env_vars("plain"), "plain");
    }
}
