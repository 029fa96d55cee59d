//! Aggregate statistics produced for a batch of replies.
//!
//! K_i: Every record here is a plain serializable value (nested maps of
//! primitives) created once per batch and read-only afterwards.

use crate::analysis::stats;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Central credible interval, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CredibleInterval {
    pub lower: f64,
    pub upper: f64,
}

impl CredibleInterval {
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    pub fn contains(&self, value: f64) -> bool {
        (self.lower..=self.upper).contains(&value)
    }
}

/// Count / mean / median / std / min / max of a set of probabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptiveStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    /// Sample standard deviation (n - 1); 0 for a single value
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

impl DescriptiveStats {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let sorted = stats::sorted(samples);
        Some(Self {
            count: sorted.len(),
            mean: stats::mean(&sorted)?,
            median: stats::percentile_sorted(&sorted, 50.0)?,
            std_dev: stats::sample_std(&sorted),
            min: *sorted.first()?,
            max: *sorted.last()?,
        })
    }
}

/// Per-source summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStatistics {
    pub queries: usize,
    pub successful: usize,
    pub success_rate: f64,
    /// Statistics over the source's valid probabilities, if any
    pub probabilities: Option<DescriptiveStats>,
    /// Self-consistency score in [0, 1]
    pub consistency: Option<f64>,
    /// Share of the Bayesian weight mass held by this source
    pub bayesian_weight: Option<f64>,
}

/// Which estimate was selected as the recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedMethod {
    ConsistencyWeighted,
    Bayesian,
    EnsembleOfMethods,
}

impl fmt::Display for RecommendedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ConsistencyWeighted => "consistency_weighted",
            Self::Bayesian => "bayesian",
            Self::EnsembleOfMethods => "ensemble_of_methods",
        };
        f.write_str(s)
    }
}

/// Outputs of the advanced aggregation methods.
///
/// Optional fields are `None` when that stage fell back and was
/// skipped from the blend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodEstimates {
    pub simple_mean: f64,
    pub median: f64,
    /// 10% trimmed mean
    pub trimmed_mean: f64,

    pub calibrated_mean: Option<f64>,
    pub calibration_temperature: Option<f64>,

    pub consistency_weighted: Option<f64>,
    pub ensemble_consistency: f64,
    /// Mean pairwise Spearman agreement of iteration order, mapped to [0, 1]
    #[serde(default)]
    pub rank_agreement: Option<f64>,

    pub bayesian_mean: Option<f64>,
    pub bayesian_interval: Option<CredibleInterval>,
    pub bayesian_uncertainty: Option<f64>,
    pub outliers_detected: usize,

    /// Unweighted mean of the available point estimates
    pub ensemble_of_methods: f64,
    /// Population std across those estimates
    pub methods_std: f64,
    pub methods_used: Vec<String>,

    pub recommended_estimate: f64,
    pub recommended_method: RecommendedMethod,
    /// Confidence in the recommendation, in [0, 1]
    pub confidence: f64,
}

/// Spread of all valid probabilities around their mean.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusAnalysis {
    /// max(0, 1 - CV); `None` when the mean is not positive
    pub consensus_score: Option<f64>,
    /// Sample standard deviation (n - 1)
    pub std_dev: f64,
    pub coefficient_of_variation: Option<f64>,
    pub p25: f64,
    pub p75: f64,
    pub iqr: f64,
    pub range: f64,
    pub count: usize,
}

/// Side-by-side metrics for one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetrics {
    /// Valid probabilities
    pub count: usize,
    pub success_rate: f64,
    pub mean: Option<f64>,
    /// Sample standard deviation; 0 below two probabilities
    pub std_dev: f64,
    /// 1 / (1 + std_dev)
    pub consistency: f64,
    pub mean_elapsed_ms: f64,
}

/// Source ids ordered best first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceRankings {
    pub by_consistency: Vec<String>,
    pub by_success_rate: Vec<String>,
    pub by_speed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceComparison {
    pub metrics: BTreeMap<String, SourceMetrics>,
    pub rankings: SourceRankings,
}

/// Summary of per-source consistency scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub mean: f64,
    pub median: f64,
    /// Population standard deviation of the scores
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    /// Number of sources per consistency level label
    pub level_distribution: BTreeMap<String, usize>,
    pub recommendations: Vec<String>,
}

/// Final aggregate of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleStatistics {
    pub total_queries: usize,
    pub successful_queries: usize,
    pub failed_queries: usize,
    pub valid_probabilities: usize,
    /// Reply count per status string
    pub status_counts: BTreeMap<String, usize>,
    pub overall: DescriptiveStats,
    pub sources: BTreeMap<String, SourceStatistics>,
    pub methods: MethodEstimates,

    #[serde(default)]
    pub consensus: Option<ConsensusAnalysis>,
    /// Ensemble ids (`source_NN`) of replies flagged as outliers
    #[serde(default)]
    pub outlier_ids: Vec<String>,
    /// `None` for single-source batches
    #[serde(default)]
    pub comparison: Option<SourceComparison>,
    #[serde(default)]
    pub consistency_report: Option<ConsistencyReport>,
}

impl EnsembleStatistics {
    pub fn success_rate(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.successful_queries as f64 / self.total_queries as f64
        }
    }
}
