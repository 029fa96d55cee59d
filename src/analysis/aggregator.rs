//! Top-level aggregation of a reply batch into EnsembleStatistics.
//!
//! Epistemic foundation:
//! - K_i: Simple mean, median and trimmed mean are always computable once one probability exists
//! - B_i: Calibration, consistency weighting and Bayesian pooling may each fail → skipped from the blend
//! - I^B: Zero valid probabilities is the only terminal outcome (InsufficientData)

use super::{stats, BatchCalibrator, BayesianAggregator, ConsistencyScorer};
use crate::models::{
    group_by_source, AggregationConfig, AugurError, ConsensusAnalysis, DescriptiveStats,
    EnsembleStatistics, MethodEstimates, OutlierMethod, RecommendedMethod, Reply, Result,
    SourceComparison, SourceMetrics, SourceRankings, SourceStatistics,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const TRIM_PROPORTION: f64 = 0.1;
const METHOD_DISAGREEMENT_SCALE: f64 = 10.0;
const RAW_SPREAD_SCALE: f64 = 20.0;
const MIN_OUTLIER_SAMPLES: usize = 4;
const IQR_FENCE: f64 = 1.5;
const Z_SCORE_THRESHOLD: f64 = 2.5;

/// Brier scores against a resolved binary outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrierScores {
    pub overall: f64,
    pub sources: BTreeMap<String, f64>,
}

/// Blends consistency, calibration and Bayesian pooling into one estimate.
///
/// Owns a `BayesianAggregator`, so historical accuracy carries over
/// between successive `aggregate` calls on the same instance.
#[derive(Debug, Clone, Default)]
pub struct ForecastAggregator {
    config: AggregationConfig,
    scorer: ConsistencyScorer,
    bayesian: BayesianAggregator,
}

impl ForecastAggregator {
    pub fn new(config: AggregationConfig) -> Self {
        Self {
            scorer: ConsistencyScorer::new(config.consistency.clone()),
            bayesian: BayesianAggregator::new(config.bayesian.clone()),
            config,
        }
    }

    pub fn bayesian(&self) -> &BayesianAggregator {
        &self.bayesian
    }

    /// Aggregate a complete or partial batch.
    ///
    /// B_i(at least one valid probability) → Err(InsufficientData) otherwise
    pub fn aggregate(&mut self, replies: &[Reply]) -> Result<EnsembleStatistics> {
        let batches = group_by_source(replies);

        let mut samples: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut all = Vec::new();
        let mut ids = Vec::new();
        for batch in &batches {
            let probs = batch.probabilities();
            if probs.is_empty() {
                continue;
            }
            all.extend_from_slice(&probs);
            ids.extend(std::iter::repeat_n(batch.source_id.to_string(), probs.len()));
            samples.insert(batch.source_id.to_string(), probs);
        }

        let overall = DescriptiveStats::from_samples(&all).ok_or(AugurError::InsufficientData {
            total_replies: replies.len(),
        })?;

        // Consistency
        let ensemble = self.scorer.score_ensemble(&samples);
        let consistency_weighted = self.scorer.weighted_aggregate(&samples);

        // Calibration
        let mut calibrator = BatchCalibrator::new(self.config.calibration.clone());
        let (calibrated_mean, calibration_temperature) = match calibrator.calibrate_batch(&all) {
            Ok(calibrated) => (stats::mean(&calibrated), calibrator.temperature()),
            Err(e) => {
                warn!(error = %e, "Calibration failed, skipping calibrated estimate");
                (None, None)
            }
        };

        // Bayesian pooling, each reply weighted by its source's consistency
        let confidences: Vec<f64> = ids
            .iter()
            .map(|id| ensemble.sources.get(id).map_or(1.0, |r| r.score))
            .collect();
        let posterior = self.bayesian.aggregate(&all, &ids, Some(&confidences));
        if posterior.is_none() {
            warn!("Bayesian pooling produced no estimate");
        }

        let simple_mean = overall.mean;
        let mut methods_used = vec!["simple_mean".to_string()];
        let mut estimates = vec![simple_mean];
        for (name, value) in [
            ("calibrated", calibrated_mean),
            ("consistency_weighted", consistency_weighted),
            ("bayesian", posterior.as_ref().map(|p| p.mean)),
        ] {
            if let Some(v) = value.filter(|v| v.is_finite()) {
                methods_used.push(name.to_string());
                estimates.push(v);
            }
        }
        let ensemble_of_methods = stats::mean(&estimates).unwrap_or(simple_mean);
        let methods_std = stats::population_std(&estimates);

        let (recommended_estimate, recommended_method) = match (consistency_weighted, &posterior) {
            (Some(cw), _) if ensemble.ensemble_consistency > self.config.consistency_threshold => {
                (cw, RecommendedMethod::ConsistencyWeighted)
            }
            (_, Some(p)) if p.uncertainty > self.config.uncertainty_threshold => {
                (p.mean, RecommendedMethod::Bayesian)
            }
            _ => (ensemble_of_methods, RecommendedMethod::EnsembleOfMethods),
        };

        let sample_factor =
            (all.len() as f64 / self.config.sample_saturation.max(1) as f64).min(1.0);
        let factors = [
            1.0 / (1.0 + methods_std / METHOD_DISAGREEMENT_SCALE),
            ensemble.ensemble_consistency,
            sample_factor,
            1.0 / (1.0 + stats::population_std(&all) / RAW_SPREAD_SCALE),
        ];
        let confidence = stats::mean(&factors).unwrap_or(0.0).clamp(0.0, 1.0);

        let sources = batches
            .iter()
            .map(|batch| {
                let probs = batch.probabilities();
                let record = SourceStatistics {
                    queries: batch.replies.len(),
                    successful: batch.successful(),
                    success_rate: batch.success_rate(),
                    probabilities: DescriptiveStats::from_samples(&probs),
                    consistency: ensemble.sources.get(batch.source_id).map(|r| r.score),
                    bayesian_weight: posterior
                        .as_ref()
                        .and_then(|p| p.source_weights.get(batch.source_id).copied()),
                };
                (batch.source_id.to_string(), record)
            })
            .collect();

        let mut status_counts = BTreeMap::new();
        for reply in replies {
            *status_counts.entry(reply.status.to_string()).or_insert(0) += 1;
        }
        let successful_queries = replies.iter().filter(|r| r.status.is_success()).count();

        let outlier_ids = self.identify_outliers(replies, self.config.outlier_method);
        if !outlier_ids.is_empty() {
            debug!(outliers = ?outlier_ids, "Flagged outlying replies");
        }

        info!(
            replies = replies.len(),
            probabilities = all.len(),
            recommended = recommended_estimate,
            method = %recommended_method,
            confidence,
            "Aggregated batch"
        );

        Ok(EnsembleStatistics {
            total_queries: replies.len(),
            successful_queries,
            failed_queries: replies.len() - successful_queries,
            valid_probabilities: all.len(),
            status_counts,
            sources,
            methods: MethodEstimates {
                simple_mean,
                median: overall.median,
                trimmed_mean: stats::trimmed_mean(&all, TRIM_PROPORTION).unwrap_or(simple_mean),
                calibrated_mean,
                calibration_temperature,
                consistency_weighted,
                ensemble_consistency: ensemble.ensemble_consistency,
                rank_agreement: ensemble.rank_agreement,
                bayesian_mean: posterior.as_ref().map(|p| p.mean),
                bayesian_interval: posterior.as_ref().map(|p| p.interval),
                bayesian_uncertainty: posterior.as_ref().map(|p| p.uncertainty),
                outliers_detected: posterior.as_ref().map_or(0, |p| p.outliers_detected),
                ensemble_of_methods,
                methods_std,
                methods_used,
                recommended_estimate,
                recommended_method,
                confidence,
            },
            overall,
            consensus: self.analyze_consensus(replies),
            outlier_ids,
            comparison: self.compare_sources(replies),
            consistency_report: self.scorer.report(&ensemble),
        })
    }

    /// Spread of all valid probabilities; `None` below two.
    pub fn analyze_consensus(&self, replies: &[Reply]) -> Option<ConsensusAnalysis> {
        let values: Vec<f64> = replies.iter().filter_map(Reply::valid_probability).collect();
        if values.len() < 2 {
            return None;
        }
        let sorted = stats::sorted(&values);
        let mean = stats::mean(&sorted)?;
        let std_dev = stats::sample_std(&sorted);
        let coefficient_of_variation = (mean > 0.0).then(|| std_dev / mean);
        let p25 = stats::percentile_sorted(&sorted, 25.0)?;
        let p75 = stats::percentile_sorted(&sorted, 75.0)?;

        Some(ConsensusAnalysis {
            consensus_score: coefficient_of_variation.map(|cv| (1.0 - cv).max(0.0)),
            std_dev,
            coefficient_of_variation,
            p25,
            p75,
            iqr: p75 - p25,
            range: sorted.last()? - sorted.first()?,
            count: sorted.len(),
        })
    }

    /// Ensemble ids of replies whose probability lies outside the ensemble's bulk.
    ///
    /// Needs at least four valid probabilities; fewer yield no outliers.
    pub fn identify_outliers(&self, replies: &[Reply], method: OutlierMethod) -> Vec<String> {
        let valid: Vec<(&Reply, f64)> = replies
            .iter()
            .filter_map(|r| r.valid_probability().map(|p| (r, p)))
            .collect();
        if valid.len() < MIN_OUTLIER_SAMPLES {
            return Vec::new();
        }
        let values: Vec<f64> = valid.iter().map(|(_, p)| *p).collect();

        let (lower, upper) = match method {
            OutlierMethod::Iqr => {
                let sorted = stats::sorted(&values);
                let (Some(q1), Some(q3)) = (
                    stats::percentile_sorted(&sorted, 25.0),
                    stats::percentile_sorted(&sorted, 75.0),
                ) else {
                    return Vec::new();
                };
                let fence = IQR_FENCE * (q3 - q1);
                (q1 - fence, q3 + fence)
            }
            OutlierMethod::ZScore => {
                // Population std; a constant batch has no z-scores
                let std = stats::population_std(&values);
                let Some(mean) = stats::mean(&values).filter(|_| std > 0.0) else {
                    return Vec::new();
                };
                (mean - Z_SCORE_THRESHOLD * std, mean + Z_SCORE_THRESHOLD * std)
            }
        };

        valid
            .into_iter()
            .filter(|(_, p)| *p < lower || *p > upper)
            .map(|(reply, _)| reply.ensemble_id())
            .collect()
    }

    /// Per-source metrics with rankings; `None` for fewer than two sources.
    ///
    /// Ties keep the order in which sources first appear in `replies`.
    pub fn compare_sources(&self, replies: &[Reply]) -> Option<SourceComparison> {
        let batches = group_by_source(replies);
        if batches.len() < 2 {
            return None;
        }

        let ordered: Vec<(String, SourceMetrics)> = batches
            .iter()
            .map(|batch| {
                let probs = batch.probabilities();
                let std_dev = stats::sample_std(&probs);
                let elapsed: Vec<f64> = batch.replies.iter().map(|r| r.elapsed_ms as f64).collect();
                let metrics = SourceMetrics {
                    count: probs.len(),
                    success_rate: batch.success_rate(),
                    mean: stats::mean(&probs),
                    std_dev,
                    consistency: 1.0 / (1.0 + std_dev),
                    mean_elapsed_ms: stats::mean(&elapsed).unwrap_or(0.0),
                };
                (batch.source_id.to_string(), metrics)
            })
            .collect();

        let ranked = |key: fn(&SourceMetrics) -> f64, descending: bool| -> Vec<String> {
            let mut order: Vec<&(String, SourceMetrics)> = ordered.iter().collect();
            order.sort_by(|(_, a), (_, b)| {
                let cmp = key(a).total_cmp(&key(b));
                if descending { cmp.reverse() } else { cmp }
            });
            order.into_iter().map(|(id, _)| id.clone()).collect()
        };

        let rankings = SourceRankings {
            by_consistency: ranked(|m| m.consistency, true),
            by_success_rate: ranked(|m| m.success_rate, true),
            by_speed: ranked(|m| m.mean_elapsed_ms, false),
        };

        Some(SourceComparison {
            metrics: ordered.into_iter().collect(),
            rankings,
        })
    }
}

/// Brier score per source and overall, once the question has resolved.
///
/// `None` when no reply carries a usable probability.
pub fn brier_scores(replies: &[Reply], outcome: bool) -> Option<BrierScores> {
    let target = if outcome { 1.0 } else { 0.0 };
    let squared_error = |p: f64| (p / 100.0 - target).powi(2);

    let mut sources = BTreeMap::new();
    let mut all = Vec::new();
    for batch in group_by_source(replies) {
        let errors: Vec<f64> = batch.probabilities().into_iter().map(squared_error).collect();
        if let Some(score) = stats::mean(&errors) {
            sources.insert(batch.source_id.to_string(), score);
        }
        all.extend(errors);
    }

    Some(BrierScores {
        overall: stats::mean(&all)?,
        sources,
    })
}
