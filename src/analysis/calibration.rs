//! Post-hoc batch calibration of forecast probabilities.
//!
//! Epistemic foundation:
//! - K_i: Temperature scaling is a monotone bijection on (0, 1) → invertible
//! - B_i: Dispersion among same-question estimates signals overconfidence (heuristic)
//! - B_i: Fitting may fail on degenerate input → Result, caller falls back to T = 1.0
//! - I^R: Mapping family and heuristic constants are configurable

use super::stats;
use crate::models::{AugurError, CalibrationConfig, CalibrationMethod, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Clip applied before taking logits.
const EPSILON: f64 = 1e-7;
/// Bounds on the supervised temperature.
const SUPERVISED_T_BOUNDS: (f64, f64) = (0.1, 10.0);
const PLATT_RIDGE: f64 = 1e-2;
const PLATT_MAX_ITER: usize = 50;
const METRIC_BINS: usize = 10;

fn logit(p: f64) -> f64 {
    let p = p.clamp(EPSILON, 1.0 - EPSILON);
    (p / (1.0 - p)).ln()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Fitted probability mapping (probability scale, 0..1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationMapping {
    /// sigmoid(logit(p) / T)
    Temperature { temperature: f64 },
    /// sigmoid(slope * logit(p) + intercept)
    Platt { slope: f64, intercept: f64 },
    /// Monotone step function, linearly interpolated between knots
    Isotonic { knots: Vec<(f64, f64)> },
}

/// Calibration parameters plus fitted flag. Serializable for reuse
/// on later batches once outcomes are known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationState {
    pub mapping: CalibrationMapping,
    /// Fitted against observed outcomes
    pub supervised: bool,
    pub fitted: bool,
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self {
            mapping: CalibrationMapping::Temperature { temperature: 1.0 },
            supervised: false,
            fitted: false,
        }
    }
}

impl CalibrationState {
    /// A fitted temperature mapping.
    pub fn temperature(temperature: f64) -> Self {
        Self {
            mapping: CalibrationMapping::Temperature { temperature },
            supervised: false,
            fitted: true,
        }
    }
}

/// Reliability metrics of predictions against outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationMetrics {
    pub expected_calibration_error: f64,
    pub maximum_calibration_error: f64,
    pub brier_score: f64,
}

/// Fit-once, apply-many calibrator over a batch of probabilities in [0, 100].
#[derive(Debug, Clone, Default)]
pub struct BatchCalibrator {
    config: CalibrationConfig,
    state: CalibrationState,
}

impl BatchCalibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        Self {
            config,
            state: CalibrationState::default(),
        }
    }

    /// Restore a previously fitted calibrator.
    pub fn from_state(config: CalibrationConfig, state: CalibrationState) -> Self {
        Self { config, state }
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn is_fitted(&self) -> bool {
        self.state.fitted
    }

    /// Fitted temperature, if the mapping is temperature scaling.
    pub fn temperature(&self) -> Option<f64> {
        match self.state.mapping {
            CalibrationMapping::Temperature { temperature } => Some(temperature),
            _ => None,
        }
    }

    /// Fit the mapping on `probabilities`, supervised when outcomes are given.
    ///
    /// B_i(input non-degenerate) → Result
    pub fn fit(&mut self, probabilities: &[f64], outcomes: Option<&[bool]>) -> Result<()> {
        if probabilities.is_empty() {
            return Err(AugurError::InvalidInput(
                "cannot calibrate an empty batch".to_string(),
            ));
        }
        if probabilities.iter().any(|p| !p.is_finite()) {
            return Err(AugurError::InvalidInput(
                "calibration input contains non-finite values".to_string(),
            ));
        }
        let probs: Vec<f64> = probabilities.iter().map(|p| (p / 100.0).clamp(0.0, 1.0)).collect();

        self.state = match outcomes {
            Some(outcomes) => {
                if outcomes.len() != probs.len() {
                    return Err(AugurError::InvalidInput(format!(
                        "{} outcomes for {} probabilities",
                        outcomes.len(),
                        probs.len()
                    )));
                }
                let mapping = match self.config.method {
                    CalibrationMethod::Temperature => CalibrationMapping::Temperature {
                        temperature: fit_temperature(&probs, outcomes),
                    },
                    CalibrationMethod::Platt => fit_platt(&probs, outcomes)?,
                    CalibrationMethod::Isotonic => fit_isotonic(&probs, outcomes),
                };
                CalibrationState {
                    mapping,
                    supervised: true,
                    fitted: true,
                }
            }
            None => CalibrationState::temperature(self.variance_temperature(&probs)),
        };

        debug!(mapping = ?self.state.mapping, supervised = self.state.supervised, "Fitted calibration");
        Ok(())
    }

    /// Temperature from the mean within-batch variance of sorted probabilities.
    fn variance_temperature(&self, probs: &[f64]) -> f64 {
        let sorted = stats::sorted(probs);
        let variances: Vec<f64> = sorted
            .chunks(self.config.batch_size.max(1))
            .filter(|batch| batch.len() > 1)
            .map(stats::population_variance)
            .collect();

        match stats::mean(&variances) {
            Some(avg) => (1.0 + (avg - self.config.baseline_variance) * self.config.variance_gain)
                .clamp(self.config.min_temperature, self.config.max_temperature),
            None => 1.0,
        }
    }

    /// Map one probability in [0, 100]. Unfitted calibrators pass values through.
    pub fn calibrate(&self, probability: f64) -> f64 {
        if !self.state.fitted {
            return probability;
        }
        let p = probability / 100.0;

        let calibrated = match &self.state.mapping {
            CalibrationMapping::Temperature { temperature } => {
                if *temperature == 1.0 {
                    return probability;
                }
                sigmoid(logit(p) / temperature)
            }
            CalibrationMapping::Platt { slope, intercept } => sigmoid(slope * logit(p) + intercept),
            CalibrationMapping::Isotonic { knots } => interpolate(knots, p.clamp(0.0, 1.0)),
        };

        (calibrated * 100.0).clamp(0.0, 100.0)
    }

    /// Fit on the batch if needed, then map every value.
    pub fn calibrate_batch(&mut self, probabilities: &[f64]) -> Result<Vec<f64>> {
        if !self.state.fitted {
            self.fit(probabilities, None)?;
        }
        Ok(probabilities.iter().map(|&p| self.calibrate(p)).collect())
    }

    /// Invert a calibrated value. Only temperature scaling is invertible.
    pub fn decalibrate(&self, calibrated: f64) -> Option<f64> {
        if !self.state.fitted {
            return Some(calibrated);
        }
        match self.state.mapping {
            CalibrationMapping::Temperature { temperature } if temperature == 1.0 => Some(calibrated),
            CalibrationMapping::Temperature { temperature } => {
                Some((sigmoid(logit(calibrated / 100.0) * temperature) * 100.0).clamp(0.0, 100.0))
            }
            _ => None,
        }
    }
}

/// Expected/maximum calibration error over 10 equal-width bins, and Brier score.
pub fn calibration_metrics(probabilities: &[f64], outcomes: &[bool]) -> Result<CalibrationMetrics> {
    if probabilities.is_empty() || probabilities.len() != outcomes.len() {
        return Err(AugurError::InvalidInput(format!(
            "{} outcomes for {} probabilities",
            outcomes.len(),
            probabilities.len()
        )));
    }

    let n = probabilities.len() as f64;
    let mut bins = [(0usize, 0.0f64, 0.0f64); METRIC_BINS];
    let mut brier = 0.0;

    for (&p, &o) in probabilities.iter().zip(outcomes) {
        let p = (p / 100.0).clamp(0.0, 1.0);
        let y = if o { 1.0 } else { 0.0 };
        brier += (p - y).powi(2);

        // (lo, hi] bins, with 0 folded into the first
        let idx = ((p * METRIC_BINS as f64).ceil() as usize).clamp(1, METRIC_BINS) - 1;
        bins[idx].0 += 1;
        bins[idx].1 += p;
        bins[idx].2 += y;
    }

    let mut ece = 0.0;
    let mut mce = 0.0f64;
    for &(count, conf_sum, acc_sum) in bins.iter().filter(|b| b.0 > 0) {
        let c = count as f64;
        let gap = (acc_sum / c - conf_sum / c).abs();
        ece += (c / n) * gap;
        mce = mce.max(gap);
    }

    Ok(CalibrationMetrics {
        expected_calibration_error: ece,
        maximum_calibration_error: mce,
        brier_score: brier / n,
    })
}

fn negative_log_likelihood(logits: &[f64], outcomes: &[bool], inverse_t: f64) -> f64 {
    let total: f64 = logits
        .iter()
        .zip(outcomes)
        .map(|(&z, &y)| {
            let s = sigmoid(z * inverse_t).clamp(EPSILON, 1.0 - EPSILON);
            if y { -s.ln() } else { -(1.0 - s).ln() }
        })
        .sum();
    total / logits.len() as f64
}

/// Maximum-likelihood temperature in [0.1, 10].
///
/// The NLL is convex in 1/T, and 1/T shares the same bounds, so a
/// golden-section search over 1/T finds the optimum.
fn fit_temperature(probs: &[f64], outcomes: &[bool]) -> f64 {
    let logits: Vec<f64> = probs.iter().map(|&p| logit(p)).collect();
    let phi = (5.0_f64.sqrt() - 1.0) / 2.0;
    let (mut lo, mut hi) = SUPERVISED_T_BOUNDS;

    let mut c = hi - phi * (hi - lo);
    let mut d = lo + phi * (hi - lo);
    let mut fc = negative_log_likelihood(&logits, outcomes, c);
    let mut fd = negative_log_likelihood(&logits, outcomes, d);

    for _ in 0..200 {
        if (hi - lo).abs() < 1e-9 {
            break;
        }
        if fc < fd {
            hi = d;
            d = c;
            fd = fc;
            c = hi - phi * (hi - lo);
            fc = negative_log_likelihood(&logits, outcomes, c);
        } else {
            lo = c;
            c = d;
            fc = fd;
            d = lo + phi * (hi - lo);
            fd = negative_log_likelihood(&logits, outcomes, d);
        }
    }

    let inverse_t = (lo + hi) / 2.0;
    (1.0 / inverse_t).clamp(SUPERVISED_T_BOUNDS.0, SUPERVISED_T_BOUNDS.1)
}

/// Ridge-regularized logistic regression on logits, fitted by Newton steps.
fn fit_platt(probs: &[f64], outcomes: &[bool]) -> Result<CalibrationMapping> {
    let logits: Vec<f64> = probs.iter().map(|&p| logit(p)).collect();
    let (mut a, mut b) = (1.0, 0.0);

    for _ in 0..PLATT_MAX_ITER {
        let (mut ga, mut gb) = (PLATT_RIDGE * a, PLATT_RIDGE * b);
        let (mut haa, mut hab, mut hbb) = (PLATT_RIDGE, 0.0, PLATT_RIDGE);

        for (&z, &y) in logits.iter().zip(outcomes) {
            let s = sigmoid(a * z + b);
            let r = s - if y { 1.0 } else { 0.0 };
            let w = s * (1.0 - s);
            ga += r * z;
            gb += r;
            haa += w * z * z;
            hab += w * z;
            hbb += w;
        }

        let det = haa * hbb - hab * hab;
        if det <= 0.0 || !det.is_finite() {
            return Err(AugurError::InvalidInput(
                "Platt scaling: singular Hessian".to_string(),
            ));
        }
        let step_a = (hbb * ga - hab * gb) / det;
        let step_b = (haa * gb - hab * ga) / det;
        a -= step_a;
        b -= step_b;

        if step_a.abs() + step_b.abs() < 1e-10 {
            break;
        }
    }

    if !(a.is_finite() && b.is_finite()) {
        return Err(AugurError::InvalidInput(
            "Platt scaling diverged".to_string(),
        ));
    }
    Ok(CalibrationMapping::Platt {
        slope: a,
        intercept: b,
    })
}

/// Pool-adjacent-violators fit; knots are (probability, outcome rate).
fn fit_isotonic(probs: &[f64], outcomes: &[bool]) -> CalibrationMapping {
    let mut pairs: Vec<(f64, f64)> = probs
        .iter()
        .zip(outcomes)
        .map(|(&p, &o)| (p, if o { 1.0 } else { 0.0 }))
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    // (x_min, x_max, sum_y, weight)
    let mut blocks: Vec<(f64, f64, f64, f64)> = Vec::new();
    for (x, y) in pairs {
        match blocks.last_mut() {
            Some(last) if last.1 == x => {
                last.2 += y;
                last.3 += 1.0;
            }
            _ => blocks.push((x, x, y, 1.0)),
        }
        while blocks.len() > 1 {
            let n = blocks.len();
            let (prev, cur) = (blocks[n - 2], blocks[n - 1]);
            if prev.2 / prev.3 <= cur.2 / cur.3 {
                break;
            }
            blocks.truncate(n - 2);
            blocks.push((prev.0, cur.1, prev.2 + cur.2, prev.3 + cur.3));
        }
    }

    let mut knots = Vec::with_capacity(blocks.len() * 2);
    for (x_min, x_max, sum, weight) in blocks {
        let v = sum / weight;
        knots.push((x_min, v));
        if x_max > x_min {
            knots.push((x_max, v));
        }
    }
    CalibrationMapping::Isotonic { knots }
}

fn interpolate(knots: &[(f64, f64)], x: f64) -> f64 {
    let (Some(first), Some(last)) = (knots.first(), knots.last()) else {
        return x;
    };
    if x <= first.0 {
        return first.1;
    }
    if x >= last.0 {
        return last.1;
    }
    for pair in knots.windows(2) {
        let ((x0, y0), (x1, y1)) = (pair[0], pair[1]);
        if x >= x0 && x <= x1 {
            if x1 == x0 {
                return y1;
            }
            return y0 + (y1 - y0) * (x - x0) / (x1 - x0);
        }
    }
    last.1
}

/// Independent calibrators per source.
#[derive(Debug, Clone, Default)]
pub struct SourceCalibrator {
    config: CalibrationConfig,
    calibrators: BTreeMap<String, BatchCalibrator>,
}

impl SourceCalibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        Self {
            config,
            calibrators: BTreeMap::new(),
        }
    }

    /// Fit (or refit) the calibrator for one source.
    pub fn fit_source(
        &mut self,
        source_id: &str,
        probabilities: &[f64],
        outcomes: Option<&[bool]>,
    ) -> Result<()> {
        let mut calibrator = BatchCalibrator::new(self.config.clone());
        calibrator.fit(probabilities, outcomes)?;
        self.calibrators.insert(source_id.to_string(), calibrator);
        Ok(())
    }

    pub fn get(&self, source_id: &str) -> Option<&BatchCalibrator> {
        self.calibrators.get(source_id)
    }

    /// Calibrate every source, fitting unseen sources on their own batch.
    pub fn calibrate_sources(
        &mut self,
        samples: &BTreeMap<String, Vec<f64>>,
    ) -> Result<BTreeMap<String, Vec<f64>>> {
        let mut out = BTreeMap::new();
        for (source_id, probabilities) in samples {
            let calibrator = self
                .calibrators
                .entry(source_id.clone())
                .or_insert_with(|| BatchCalibrator::new(self.config.clone()));
            out.insert(source_id.clone(), calibrator.calibrate_batch(probabilities)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calibrator(method: CalibrationMethod) -> BatchCalibrator {
        BatchCalibrator::new(CalibrationConfig {
            method,
            ..Default::default()
        })
    }

    #[test]
    fn test_unit_temperature_is_identity() {
        let cal = BatchCalibrator::from_state(CalibrationConfig::default(), CalibrationState::temperature(1.0));
        for p in [0.0, 0.5, 12.34, 37.3, 50.0, 99.999, 100.0] {
            assert_eq!(cal.calibrate(p), p);
            assert_eq!(cal.decalibrate(p), Some(p));
        }
    }

    #[test]
    fn test_unfitted_passes_through() {
        let cal = BatchCalibrator::default();
        assert!(!cal.is_fitted());
        assert_eq!(cal.calibrate(73.0), 73.0);
    }

    #[test]
    fn test_calibration_is_deterministic_for_fixed_state() {
        let batch = [12.0, 25.0, 31.0, 48.0, 77.0, 90.0];
        let mut cal = BatchCalibrator::default();
        let first = cal.calibrate_batch(&batch).unwrap();
        let t = cal.temperature();
        let second = cal.calibrate_batch(&batch).unwrap();
        assert_eq!(first, second);
        assert_eq!(cal.temperature(), t);

        let restored = BatchCalibrator::from_state(CalibrationConfig::default(), cal.state().clone());
        let third: Vec<f64> = batch.iter().map(|&p| restored.calibrate(p)).collect();
        assert_eq!(first, third);
    }

    #[test]
    fn test_tight_batch_sharpens() {
        let batch: Vec<f64> = (0..10).map(|i| 30.0 + i as f64 * 0.5).collect();
        let mut cal = BatchCalibrator::default();
        cal.fit(&batch, None).unwrap();
        let t = cal.temperature().unwrap();
        assert!(t < 1.0 && t >= 0.5, "{t}");
        assert!(cal.calibrate(30.0) < 30.0);
    }

    #[test]
    fn test_dispersed_batch_clamps_to_max_temperature() {
        let batch: Vec<f64> = (0..10).map(|i| if i % 2 == 0 { 5.0 } else { 95.0 }).collect();
        let mut cal = BatchCalibrator::default();
        cal.fit(&batch, None).unwrap();
        assert_eq!(cal.temperature(), Some(2.0));

        let c = cal.calibrate(90.0);
        assert!(c < 90.0 && c > 50.0);
        assert!((cal.decalibrate(c).unwrap() - 90.0).abs() < 1e-6);
    }

    #[test]
    fn test_single_value_batch_keeps_unit_temperature() {
        let mut cal = BatchCalibrator::default();
        cal.fit(&[42.0], None).unwrap();
        assert_eq!(cal.temperature(), Some(1.0));
        assert_eq!(cal.calibrate(42.0), 42.0);
    }

    #[test]
    fn test_fit_rejects_degenerate_input() {
        let mut cal = BatchCalibrator::default();
        assert!(cal.fit(&[], None).is_err());
        assert!(cal.fit(&[f64::NAN, 10.0], None).is_err());
        assert!(cal.fit(&[10.0, 20.0], Some(&[true])).is_err());
        assert!(!cal.is_fitted());
    }

    #[test]
    fn test_supervised_temperature_softens_overconfidence() {
        let mut probs = vec![90.0; 10];
        probs.extend(vec![10.0; 10]);
        let mut outcomes = vec![true; 6];
        outcomes.extend(vec![false; 4]);
        outcomes.extend(vec![true; 4]);
        outcomes.extend(vec![false; 6]);

        let mut cal = calibrator(CalibrationMethod::Temperature);
        cal.fit(&probs, Some(&outcomes)).unwrap();
        let t = cal.temperature().unwrap();
        // Optimum is logit(0.9) / logit(0.6) ≈ 5.4
        assert!(t > 4.5 && t < 6.5, "{t}");
        assert!(cal.state().supervised);
        assert!((cal.calibrate(90.0) - 60.0).abs() < 2.0);
    }

    #[test]
    fn test_platt_is_monotone() {
        let probs = [10.0, 20.0, 30.0, 40.0, 60.0, 70.0, 80.0, 90.0];
        let outcomes = [false, false, true, false, true, false, true, true];
        let mut cal = calibrator(CalibrationMethod::Platt);
        cal.fit(&probs, Some(&outcomes)).unwrap();

        let mapped: Vec<f64> = (0..=10).map(|i| cal.calibrate(i as f64 * 10.0)).collect();
        assert!(mapped.windows(2).all(|w| w[0] <= w[1]));
        assert!(mapped.iter().all(|p| (0.0..=100.0).contains(p)));
        assert_eq!(cal.decalibrate(50.0), None);
    }

    #[test]
    fn test_isotonic_pools_violators() {
        let mut cal = calibrator(CalibrationMethod::Isotonic);
        cal.fit(&[10.0, 20.0, 30.0, 40.0], Some(&[false, true, false, true]))
            .unwrap();

        assert!((cal.calibrate(25.0) - 50.0).abs() < 1e-9);
        assert!((cal.calibrate(15.0) - 25.0).abs() < 1e-9);
        assert_eq!(cal.calibrate(5.0), 0.0);
        assert_eq!(cal.calibrate(95.0), 100.0);
    }

    #[test]
    fn test_metrics() {
        let perfect = calibration_metrics(&[100.0, 0.0], &[true, false]).unwrap();
        assert_eq!(perfect.brier_score, 0.0);
        assert_eq!(perfect.expected_calibration_error, 0.0);

        let m = calibration_metrics(&[80.0, 80.0], &[true, false]).unwrap();
        assert!((m.brier_score - 0.34).abs() < 1e-12);
        assert!((m.expected_calibration_error - 0.3).abs() < 1e-12);
        assert!((m.maximum_calibration_error - 0.3).abs() < 1e-12);

        assert!(calibration_metrics(&[50.0], &[]).is_err());
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let state = CalibrationState::temperature(1.7);
        let json = serde_json::to_string(&state).unwrap();
        let back: CalibrationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_source_calibrator() {
        let mut samples = BTreeMap::new();
        samples.insert("a".to_string(), vec![30.0, 31.0, 32.0]);
        samples.insert("b".to_string(), vec![42.0]);

        let mut cal = SourceCalibrator::new(CalibrationConfig::default());
        let out = cal.calibrate_sources(&samples).unwrap();
        assert_eq!(out["b"], vec![42.0]);
        assert_eq!(out["a"].len(), 3);
        assert!(cal.get("a").unwrap().is_fitted());
    }
}
