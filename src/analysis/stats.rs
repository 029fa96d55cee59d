//! Descriptive statistics shared by the aggregation stages.
//!
//! Percentiles use linear interpolation between closest ranks, so
//! quartiles of `[1, 2, 3, 4]` are 1.75 and 3.25.

use statrs::statistics::Statistics;

/// Arithmetic mean, `None` for empty input.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().mean())
    }
}

/// Population standard deviation (divides by n). Zero for fewer than 2 values.
pub fn population_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        0.0
    } else {
        values.iter().population_std_dev()
    }
}

/// Population variance (divides by n). Zero for fewer than 2 values.
pub fn population_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        0.0
    } else {
        values.iter().population_variance()
    }
}

/// Sample standard deviation (divides by n - 1). Zero for fewer than 2 values.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        0.0
    } else {
        values.iter().std_dev()
    }
}

/// Sorted copy with NaNs ordered last.
pub fn sorted(values: &[f64]) -> Vec<f64> {
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.total_cmp(b));
    v
}

/// Percentile `q` in [0, 100] of already sorted values.
pub fn percentile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    percentile_sorted(&sorted(values), q)
}

pub fn median(values: &[f64]) -> Option<f64> {
    percentile(values, 50.0)
}

/// Interquartile range.
pub fn iqr(values: &[f64]) -> f64 {
    let s = sorted(values);
    match (percentile_sorted(&s, 25.0), percentile_sorted(&s, 75.0)) {
        (Some(q1), Some(q3)) => q3 - q1,
        _ => 0.0,
    }
}

/// Mean after cutting `proportion` of the values from each end.
pub fn trimmed_mean(values: &[f64], proportion: f64) -> Option<f64> {
    let s = sorted(values);
    let cut = (s.len() as f64 * proportion.clamp(0.0, 0.5)).floor() as usize;
    if s.len() <= 2 * cut {
        return mean(&s);
    }
    mean(&s[cut..s.len() - cut])
}

/// Weighted mean; `None` when the weights carry no mass.
pub fn weighted_mean(values: &[f64], weights: &[f64]) -> Option<f64> {
    let total: f64 = weights.iter().sum();
    if values.is_empty() || values.len() != weights.len() || total <= 0.0 || !total.is_finite() {
        return None;
    }
    Some(values.iter().zip(weights).map(|(v, w)| v * w).sum::<f64>() / total)
}

/// Ranks starting at 1, ties sharing their average rank.
fn ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && values[order[end + 1]] == values[order[start]] {
            end += 1;
        }
        let rank = (start + end) as f64 / 2.0 + 1.0;
        for &idx in &order[start..=end] {
            ranks[idx] = rank;
        }
        start = end + 1;
    }
    ranks
}

/// Spearman rank correlation over the common prefix of `a` and `b`.
///
/// `None` below two paired values or when either side is constant.
pub fn spearman(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let (ra, rb) = (ranks(&a[..n]), ranks(&b[..n]));
    let (ma, mb) = (mean(&ra)?, mean(&rb)?);

    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in ra.iter().zip(&rb) {
        let (dx, dy) = (x - ma, y - mb);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    Some((cov / (var_a * var_b).sqrt()).clamp(-1.0, 1.0))
}
