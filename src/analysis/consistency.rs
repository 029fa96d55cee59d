//! Self-consistency scoring of repeated forecasts.
//!
//! Epistemic foundation:
//! - K_i: A source answering the same question repeatedly should agree with itself
//! - K_i: Fewer than 2 samples cannot contradict each other → score 1.0
//! - B_i: Spread of repeated answers is a proxy for reliability (heuristic)
//! - B_i: Sources whose answers rise and fall together across iterations agree more
//! - I^R: Scoring strategy and weighting exponents are configurable

use super::stats;
use crate::models::{ConsistencyConfig, ConsistencyMethod, ConsistencyReport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const HISTOGRAM_BINS: usize = 10;

/// Scale constants: a spread of this many points halves the partial score.
const STD_SCALE: f64 = 10.0;
const RANGE_SCALE: f64 = 30.0;
const IQR_SCALE: f64 = 20.0;

/// Qualitative consistency label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ConsistencyLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            Self::VeryHigh
        } else if score >= 0.75 {
            Self::High
        } else if score >= 0.5 {
            Self::Medium
        } else if score >= 0.25 {
            Self::Low
        } else {
            Self::VeryLow
        }
    }
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::VeryLow => "very_low",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::VeryHigh => "very_high",
        };
        f.write_str(s)
    }
}

/// Consistency of one source's repeated samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyRecord {
    pub source_id: String,
    pub score: f64,
    pub level: ConsistencyLevel,
    pub sample_count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

/// Consistency across the whole ensemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConsistency {
    pub sources: BTreeMap<String, ConsistencyRecord>,
    /// Consistency of the per-source means, averaged with `rank_agreement` when present
    pub ensemble_consistency: f64,
    /// (mean pairwise Spearman + 1) / 2 over iteration sequences
    pub rank_agreement: Option<f64>,
    pub mean_source_consistency: f64,
    pub consistency_variance: f64,
    pub most_consistent: Option<String>,
    pub least_consistent: Option<String>,
    pub recommendations: Vec<String>,
}

/// Scores how well a source agrees with itself.
#[derive(Debug, Clone, Default)]
pub struct ConsistencyScorer {
    config: ConsistencyConfig,
}

impl ConsistencyScorer {
    pub fn new(config: ConsistencyConfig) -> Self {
        Self { config }
    }

    pub fn with_method(method: ConsistencyMethod) -> Self {
        Self::new(ConsistencyConfig {
            method,
            ..Default::default()
        })
    }

    pub fn method(&self) -> ConsistencyMethod {
        self.config.method
    }

    /// Consistency in [0, 1]; higher means more self-consistent.
    ///
    /// Order-invariant: samples are sorted before any arithmetic.
    pub fn score(&self, samples: &[f64]) -> f64 {
        if samples.len() < 2 {
            return 1.0;
        }
        let sorted = stats::sorted(samples);

        let raw = match self.config.method {
            ConsistencyMethod::InverseCv => inverse_cv(&sorted),
            ConsistencyMethod::Entropy => inverse_entropy(&sorted),
            ConsistencyMethod::Blend => blend(&sorted),
        };

        if raw.is_nan() { 0.0 } else { raw.clamp(0.0, 1.0) }
    }

    /// Score one source and summarize its samples.
    pub fn score_source(&self, source_id: &str, samples: &[f64]) -> ConsistencyRecord {
        let score = self.score(samples);
        let sorted = stats::sorted(samples);
        ConsistencyRecord {
            source_id: source_id.to_string(),
            score,
            level: ConsistencyLevel::from_score(score),
            sample_count: samples.len(),
            mean: stats::mean(&sorted).unwrap_or(0.0),
            std_dev: stats::population_std(&sorted),
            min: sorted.first().copied().unwrap_or(0.0),
            max: sorted.last().copied().unwrap_or(0.0),
        }
    }

    /// Score every source and the agreement between their means.
    pub fn score_ensemble(&self, samples: &BTreeMap<String, Vec<f64>>) -> EnsembleConsistency {
        let sources: BTreeMap<String, ConsistencyRecord> = samples
            .iter()
            .map(|(id, s)| (id.clone(), self.score_source(id, s)))
            .collect();

        let scores: Vec<f64> = sources.values().map(|r| r.score).collect();
        let means: Vec<f64> = samples
            .values()
            .filter_map(|s| stats::mean(s))
            .collect();

        let most_consistent = sources
            .values()
            .max_by(|a, b| a.score.total_cmp(&b.score))
            .map(|r| r.source_id.clone());
        let least_consistent = sources
            .values()
            .min_by(|a, b| a.score.total_cmp(&b.score))
            .map(|r| r.source_id.clone());

        let mean_source_consistency = stats::mean(&scores).unwrap_or(0.0);
        let consistency_variance = stats::population_variance(&scores);

        let spread_of_means = self.score(&means);
        let rank_agreement = if means.len() >= 2 {
            rank_agreement(samples)
        } else {
            None
        };
        let ensemble_consistency = match rank_agreement {
            Some(agreement) => (spread_of_means + agreement) / 2.0,
            None => spread_of_means,
        };

        EnsembleConsistency {
            recommendations: recommendations(&sources, mean_source_consistency, consistency_variance),
            ensemble_consistency,
            rank_agreement,
            mean_source_consistency,
            consistency_variance,
            most_consistent,
            least_consistent,
            sources,
        }
    }

    /// Summary of the per-source scores; `None` when no source was scored.
    pub fn report(&self, ensemble: &EnsembleConsistency) -> Option<ConsistencyReport> {
        let scores: Vec<f64> = ensemble.sources.values().map(|r| r.score).collect();
        let sorted = stats::sorted(&scores);

        let mut level_distribution = BTreeMap::new();
        for record in ensemble.sources.values() {
            *level_distribution.entry(record.level.to_string()).or_insert(0) += 1;
        }

        Some(ConsistencyReport {
            mean: stats::mean(&sorted)?,
            median: stats::percentile_sorted(&sorted, 50.0)?,
            std_dev: stats::population_std(&sorted),
            min: *sorted.first()?,
            max: *sorted.last()?,
            level_distribution,
            recommendations: ensemble.recommendations.clone(),
        })
    }

    /// Mean of per-source means weighted by consistency^exponent.
    ///
    /// Falls back to the unweighted mean of all samples when the weights
    /// carry no mass; `None` when there are no samples at all.
    pub fn weighted_aggregate(&self, samples: &BTreeMap<String, Vec<f64>>) -> Option<f64> {
        let (means, weights): (Vec<f64>, Vec<f64>) = samples
            .values()
            .filter_map(|s| {
                let mean = stats::mean(s)?;
                Some((mean, self.score(s).powf(self.config.weighting_exponent)))
            })
            .unzip();

        stats::weighted_mean(&means, &weights).or_else(|| {
            let all: Vec<f64> = samples.values().flatten().copied().collect();
            stats::mean(&all)
        })
    }

    /// Per-source weights proportional to consistency^confidence_exponent, summing to 1.
    pub fn confidence_weights(&self, samples: &BTreeMap<String, Vec<f64>>) -> BTreeMap<String, f64> {
        let mut weights: BTreeMap<String, f64> = samples
            .iter()
            .map(|(id, s)| (id.clone(), self.score(s).powf(self.config.confidence_exponent)))
            .collect();

        let total: f64 = weights.values().sum();
        if total > 0.0 {
            for w in weights.values_mut() {
                *w /= total;
            }
        }
        weights
    }
}

/// Pairs with a constant side carry no rank information and are skipped.
fn rank_agreement(samples: &BTreeMap<String, Vec<f64>>) -> Option<f64> {
    let series: Vec<&[f64]> = samples
        .values()
        .filter(|s| s.len() > 1)
        .map(Vec::as_slice)
        .collect();

    let mut correlations = Vec::new();
    for (i, a) in series.iter().enumerate() {
        for b in &series[i + 1..] {
            if let Some(rho) = stats::spearman(a, b) {
                correlations.push(rho);
            }
        }
    }
    stats::mean(&correlations).map(|rho| (rho + 1.0) / 2.0)
}

fn inverse_cv(sorted: &[f64]) -> f64 {
    let mean = stats::mean(sorted).unwrap_or(0.0);
    let std = stats::population_std(sorted);
    if mean > 0.0 {
        1.0 / (1.0 + std / mean)
    } else if std == 0.0 {
        1.0
    } else {
        0.0
    }
}

fn inverse_entropy(sorted: &[f64]) -> f64 {
    let mut counts = [0usize; HISTOGRAM_BINS];
    for &v in sorted {
        let bin = ((v.clamp(0.0, 100.0) / 100.0) * HISTOGRAM_BINS as f64) as usize;
        counts[bin.min(HISTOGRAM_BINS - 1)] += 1;
    }

    let n = sorted.len() as f64;
    let entropy: f64 = counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.ln()
        })
        .sum();

    1.0 - entropy / (HISTOGRAM_BINS as f64).ln()
}

fn blend(sorted: &[f64]) -> f64 {
    let std_score = 1.0 / (1.0 + stats::population_std(sorted) / STD_SCALE);

    let range = sorted.last().copied().unwrap_or(0.0) - sorted.first().copied().unwrap_or(0.0);
    let range_score = 1.0 / (1.0 + range / RANGE_SCALE);

    let iqr_score = 1.0 / (1.0 + stats::iqr(sorted) / IQR_SCALE);

    (std_score + range_score + iqr_score) / 3.0
}

fn recommendations(
    sources: &BTreeMap<String, ConsistencyRecord>,
    mean_consistency: f64,
    variance: f64,
) -> Vec<String> {
    if sources.is_empty() {
        return vec!["Insufficient data for recommendations".to_string()];
    }

    let mut out = Vec::new();
    if mean_consistency < 0.5 {
        out.push(
            "Low overall consistency: increase iterations or review prompt clarity".to_string(),
        );
    }
    if mean_consistency > 0.8 {
        out.push("High consistency: predictions are reliable for aggregation".to_string());
    }
    if sources.len() > 1 && variance > 0.1 {
        out.push("High variance in source consistencies: consider per-source calibration".to_string());
    }
    for record in sources.values().filter(|r| r.score < 0.3) {
        out.push(format!(
            "Source {} shows very low consistency: consider excluding or recalibrating",
            record.source_id
        ));
    }
    out
}
