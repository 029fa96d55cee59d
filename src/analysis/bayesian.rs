//! Robust Bayesian pooling of forecast probabilities.
//!
//! Epistemic foundation:
//! - K_i: A Beta posterior is closed-form given pseudo-counts
//! - B_i: Samples far from the median are less trustworthy → down-weighted, never dropped
//! - B_i: Past disagreement with consensus predicts future disagreement
//! - I^B: Historical error is bounded to the most recent `history_window` entries
//!
//! Pipeline per call: outlier flags → base weights (confidence, outlier
//! penalty, history) → consensus reweighting → Beta pooling → history update.

use super::stats;
use crate::models::{BayesianConfig, CredibleInterval};
use serde::{Deserialize, Serialize};
use statrs::distribution::{Beta, ContinuousCDF};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

/// Scale factor turning MAD into a normal-consistent z-score.
const MAD_Z_SCALE: f64 = 0.6745;
const IQR_FENCE: f64 = 1.5;
const MIN_OUTLIER_SAMPLES: usize = 3;
const INTERVAL_LEVEL: f64 = 0.95;
const PRECISION_EPSILON: f64 = 1e-10;

/// Pooled posterior for one aggregation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PosteriorEstimate {
    /// Posterior mean in percent, bounded by the observed range
    pub mean: f64,
    /// Posterior variance on the probability scale
    pub variance: f64,
    /// 2.5 to 97.5 percentile interval in percent, widened to contain `mean`
    pub interval: CredibleInterval,
    pub alpha: f64,
    pub beta: f64,
    /// Dispersion/concentration score in [0, 1]
    pub uncertainty: f64,
    /// Normalized weight of each input, in input order
    pub weights: Vec<f64>,
    /// Weight mass summed per source
    pub source_weights: BTreeMap<String, f64>,
    pub outliers: Vec<bool>,
    pub outliers_detected: usize,
}

/// A source's own belief, on the probability scale (0..1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BeliefDistribution {
    pub mean: f64,
    pub variance: f64,
}

/// Precision-weighted pool of belief distributions (probability scale).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PooledDistribution {
    pub mean: f64,
    /// Within-source plus between-source variance
    pub variance: f64,
    pub std_dev: f64,
    /// mean ± 1.96 sd, clamped to [0, 1]
    pub interval: (f64, f64),
    pub weights: BTreeMap<String, f64>,
}

/// Robust Bayesian aggregator with per-source error history.
///
/// Not shared: history is owned by the instance, so `aggregate` takes
/// `&mut self` and calls are serialized by the borrow checker.
#[derive(Debug, Clone, Default)]
pub struct BayesianAggregator {
    config: BayesianConfig,
    history: HashMap<String, VecDeque<f64>>,
}

impl BayesianAggregator {
    pub fn new(config: BayesianConfig) -> Self {
        Self {
            config,
            history: HashMap::new(),
        }
    }

    pub fn config(&self) -> &BayesianConfig {
        &self.config
    }

    /// Pool probabilities in [0, 100] into a Beta posterior.
    ///
    /// Returns `None` when there is nothing to aggregate. Mismatched
    /// `source_ids` are replaced by positional ids; mismatched
    /// `confidences` are ignored.
    pub fn aggregate(
        &mut self,
        probabilities: &[f64],
        source_ids: &[String],
        confidences: Option<&[f64]>,
    ) -> Option<PosteriorEstimate> {
        let probs: Vec<f64> = probabilities
            .iter()
            .filter(|p| p.is_finite())
            .map(|p| (p / 100.0).clamp(0.0, 1.0))
            .collect();
        if probs.is_empty() {
            return None;
        }

        let ids: Vec<String> = if source_ids.len() == probs.len() {
            source_ids.to_vec()
        } else {
            (0..probs.len()).map(|i| format!("expert_{i}")).collect()
        };
        let confidences = confidences.filter(|c| c.len() == probs.len());

        let outliers = self.detect_outliers(&probs);
        let outliers_detected = outliers.iter().filter(|&&o| o).count();
        if outliers_detected > 0 {
            debug!(outliers = outliers_detected, "Detected outlying forecasts");
        }

        let base = self.base_weights(&probs, &ids, confidences, &outliers);
        let weights = self.consensus_weights(&probs, base);

        let n = self.config.virtual_sample_size;
        let alpha = self.config.prior_strength
            + probs.iter().zip(&weights).map(|(p, w)| p * w * n).sum::<f64>();
        let beta = self.config.prior_strength
            + probs.iter().zip(&weights).map(|(p, w)| (1.0 - p) * w * n).sum::<f64>();

        let total = alpha + beta;
        let posterior_mean = alpha / total;
        let variance = alpha * beta / (total * total * (total + 1.0));
        let (lower, upper) = credible_interval(alpha, beta, INTERVAL_LEVEL);

        // The prior pulls toward 0.5; keep the point estimate inside the data.
        let (lo, hi) = probs
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &p| (lo.min(p), hi.max(p)));
        let mean = posterior_mean.clamp(lo, hi);
        // Saturated inputs put the bounded mean past the Beta tail; widen to keep it inside.
        let (lower, upper) = (lower.min(mean), upper.max(mean));

        let uncertainty = uncertainty(&probs, &weights);
        self.record_errors(&ids, &probs, posterior_mean);

        let mut source_weights = BTreeMap::new();
        for (id, w) in ids.iter().zip(&weights) {
            *source_weights.entry(id.clone()).or_insert(0.0) += w;
        }

        Some(PosteriorEstimate {
            mean: mean * 100.0,
            variance,
            interval: CredibleInterval {
                lower: lower * 100.0,
                upper: upper * 100.0,
            },
            alpha,
            beta,
            uncertainty,
            weights,
            source_weights,
            outliers,
            outliers_detected,
        })
    }

    /// Flag outliers by modified z-score, or the 1.5×IQR fence when MAD is zero.
    ///
    /// Scale-free: works on percent or probability values alike.
    pub fn detect_outliers(&self, values: &[f64]) -> Vec<bool> {
        if values.len() < MIN_OUTLIER_SAMPLES {
            return vec![false; values.len()];
        }

        let sorted = stats::sorted(values);
        let median = stats::percentile_sorted(&sorted, 50.0).unwrap_or(0.0);
        let deviations: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
        let mad = stats::median(&deviations).unwrap_or(0.0);

        if mad > 0.0 {
            return values
                .iter()
                .map(|v| (MAD_Z_SCALE * (v - median) / mad).abs() > self.config.outlier_threshold)
                .collect();
        }

        let q1 = stats::percentile_sorted(&sorted, 25.0).unwrap_or(0.0);
        let q3 = stats::percentile_sorted(&sorted, 75.0).unwrap_or(0.0);
        let iqr = q3 - q1;
        if iqr <= 0.0 {
            return vec![false; values.len()];
        }
        values
            .iter()
            .map(|&v| v < q1 - IQR_FENCE * iqr || v > q3 + IQR_FENCE * iqr)
            .collect()
    }

    /// Weights before consensus reweighting: confidence × outlier penalty × history factor.
    ///
    /// Non-finite or negative confidences count as zero; if nothing is left
    /// every input gets weight 1.
    pub fn base_weights(
        &self,
        probabilities: &[f64],
        source_ids: &[String],
        confidences: Option<&[f64]>,
        outliers: &[bool],
    ) -> Vec<f64> {
        let mut weights: Vec<f64> = (0..probabilities.len())
            .map(|i| {
                let confidence = confidences
                    .and_then(|c| c.get(i).copied())
                    .unwrap_or(1.0);
                let mut w = if confidence.is_finite() { confidence.max(0.0) } else { 0.0 };
                if outliers.get(i).copied().unwrap_or(false) {
                    w *= self.config.outlier_penalty;
                }
                if let Some(err) = source_ids.get(i).and_then(|id| self.average_error(id)) {
                    w *= 1.0 / (1.0 + err);
                }
                w
            })
            .collect();

        if weights.iter().sum::<f64>() <= 0.0 {
            weights.iter_mut().for_each(|w| *w = 1.0);
        }
        weights
    }

    /// Iteratively damp weights of samples far from the weighted mean, then normalize.
    fn consensus_weights(&self, probs: &[f64], mut weights: Vec<f64>) -> Vec<f64> {
        for _ in 0..self.config.consensus_iterations {
            let Some(center) = stats::weighted_mean(probs, &weights) else {
                break;
            };
            for (w, p) in weights.iter_mut().zip(probs) {
                *w *= 1.0 / (1.0 + self.config.disagreement_penalty * (p - center).abs());
            }
        }

        let total: f64 = weights.iter().sum();
        if total > 0.0 && total.is_finite() {
            weights.iter().map(|w| w / total).collect()
        } else {
            vec![1.0 / probs.len() as f64; probs.len()]
        }
    }

    fn record_errors(&mut self, ids: &[String], probs: &[f64], consensus: f64) {
        let window = self.config.history_window.max(1);
        for (id, p) in ids.iter().zip(probs) {
            let errors = self.history.entry(id.clone()).or_default();
            errors.push_back((p - consensus).abs());
            while errors.len() > window {
                errors.pop_front();
            }
        }
    }

    /// Mean absolute deviation from consensus over the tracked window.
    pub fn average_error(&self, source_id: &str) -> Option<f64> {
        let errors = self.history.get(source_id)?;
        if errors.is_empty() {
            return None;
        }
        Some(errors.iter().sum::<f64>() / errors.len() as f64)
    }

    /// Number of tracked errors for a source (never above `history_window`).
    pub fn history_len(&self, source_id: &str) -> usize {
        self.history.get(source_id).map_or(0, VecDeque::len)
    }

    /// Random-effects pooling of full belief distributions.
    ///
    /// Weights ∝ 1/variance; pooled variance = 1/Σprecision + Σw(mean − pooled)².
    pub fn pool_distributions(
        &self,
        distributions: &BTreeMap<String, BeliefDistribution>,
    ) -> Option<PooledDistribution> {
        if distributions.is_empty() {
            return None;
        }

        let precisions: Vec<f64> = distributions
            .values()
            .map(|d| 1.0 / (d.variance.max(0.0) + PRECISION_EPSILON))
            .collect();
        let total_precision: f64 = precisions.iter().sum();
        let weights: Vec<f64> = precisions.iter().map(|p| p / total_precision).collect();

        let mean: f64 = distributions
            .values()
            .zip(&weights)
            .map(|(d, w)| d.mean * w)
            .sum();
        let within = 1.0 / total_precision;
        let between: f64 = distributions
            .values()
            .zip(&weights)
            .map(|(d, w)| w * (d.mean - mean).powi(2))
            .sum();
        let variance = within + between;
        let std_dev = variance.sqrt();

        Some(PooledDistribution {
            mean,
            variance,
            std_dev,
            interval: (
                (mean - 1.96 * std_dev).max(0.0),
                (mean + 1.96 * std_dev).min(1.0),
            ),
            weights: distributions.keys().cloned().zip(weights).collect(),
        })
    }

    /// Odds-form Bayes update of a percent prior, tempered by `confidence` in [0, 1].
    pub fn evidence_update(prior: f64, likelihood_ratio: f64, confidence: f64) -> f64 {
        let p = (prior / 100.0).clamp(0.0, 1.0);
        if likelihood_ratio == 1.0 || !likelihood_ratio.is_finite() || likelihood_ratio < 0.0 {
            return p * 100.0;
        }
        let effective = 1.0 + (likelihood_ratio - 1.0) * confidence.clamp(0.0, 1.0);
        let prior_odds = p / (1.0 - p + PRECISION_EPSILON);
        let posterior_odds = prior_odds * effective;
        (posterior_odds / (1.0 + posterior_odds)) * 100.0
    }
}

/// Central credible interval of Beta(alpha, beta); (0, 1) on invalid parameters.
fn credible_interval(alpha: f64, beta: f64, level: f64) -> (f64, f64) {
    if alpha <= 0.0 || beta <= 0.0 || !alpha.is_finite() || !beta.is_finite() {
        return (0.0, 1.0);
    }
    let tail = (1.0 - level) / 2.0;
    match Beta::new(alpha, beta) {
        Ok(dist) => {
            let low = dist.inverse_cdf(tail);
            let high = dist.inverse_cdf(1.0 - tail);
            let low = if low.is_finite() { low.clamp(0.0, 1.0) } else { 0.0 };
            let high = if high.is_finite() { high.clamp(0.0, 1.0) } else { 1.0 };
            (low, high)
        }
        Err(_) => (0.0, 1.0),
    }
}

/// Mean of weighted variance, normalized weight entropy and weighted pairwise distance.
fn uncertainty(probs: &[f64], weights: &[f64]) -> f64 {
    let center = stats::weighted_mean(probs, weights).unwrap_or(0.5);
    let variance = stats::weighted_mean(
        &probs.iter().map(|p| (p - center).powi(2)).collect::<Vec<_>>(),
        weights,
    )
    .unwrap_or(0.0);

    let entropy: f64 = -weights
        .iter()
        .filter(|&&w| w > 0.0)
        .map(|w| w * w.ln())
        .sum::<f64>();
    let max_entropy = (weights.len() as f64).ln();
    let normalized_entropy = if max_entropy > 0.0 { entropy / max_entropy } else { 0.0 };

    let mut distances = Vec::new();
    for i in 0..probs.len() {
        for j in (i + 1)..probs.len() {
            distances.push((probs[i] - probs[j]).abs() * weights[i] * weights[j]);
        }
    }
    let disagreement = stats::mean(&distances).unwrap_or(0.0);

    ((variance + normalized_entropy + disagreement) / 3.0).clamp(0.0, 1.0)
}
