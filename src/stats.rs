//! Statistical utility functions shared across modules
//!
//! Weighted quantiles for the normal-prior variance, s-values shared by the
//! external estimators, and a couple of normal-distribution helpers.

use statrs::distribution::{ContinuousCDF, Normal};

/// Width of the default upper quantile used for prior variance matching
pub const DEFAULT_UPPER_QUANTILE: f64 = 0.05;

/// Prior variance returned when the weighted quantile collapses to zero
pub const MIN_PRIOR_VARIANCE: f64 = 1e-6;

/// Weighted quantile matching R's Hmisc.wtd.quantile with type='quantile' and normwt=TRUE.
///
/// Algorithm:
/// 1. Remove NA/zero-weight entries
/// 2. Sort x, aggregate weights for duplicate x values
/// 3. Normalize weights: weights *= n / sum(weights)
/// 4. order = 1 + (n - 1) * prob
/// 5. Right-continuous step interpolation on cumsum(wts) -> x at floor(order) and floor(order)+1
/// 6. Linear blend by the fractional part of order
pub fn weighted_quantile(x: &[f64], weights: &[f64], prob: f64) -> f64 {
    debug_assert_eq!(x.len(), weights.len());

    let mut pairs: Vec<(f64, f64)> = x
        .iter()
        .zip(weights.iter())
        .filter(|(&xi, &wi)| wi > 0.0 && !xi.is_nan() && !wi.is_nan())
        .map(|(&xi, &wi)| (xi, wi))
        .collect();

    if pairs.is_empty() {
        return 0.0;
    }

    pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    // Hmisc.wtd.table: aggregate duplicates
    let mut unique_x: Vec<f64> = Vec::new();
    let mut agg_weights: Vec<f64> = Vec::new();
    let mut prev_x = pairs[0].0;
    let mut sum_w = pairs[0].1;
    for &(xi, wi) in &pairs[1..] {
        if xi == prev_x {
            sum_w += wi;
        } else {
            unique_x.push(prev_x);
            agg_weights.push(sum_w);
            prev_x = xi;
            sum_w = wi;
        }
    }
    unique_x.push(prev_x);
    agg_weights.push(sum_w);

    // normwt=TRUE uses the raw (non-aggregated) count
    let n_raw = pairs.len() as f64;
    let raw_weight_sum: f64 = pairs.iter().map(|&(_, w)| w).sum();
    let norm_factor = n_raw / raw_weight_sum;
    for w in agg_weights.iter_mut() {
        *w *= norm_factor;
    }

    let n: f64 = agg_weights.iter().sum();
    let order = 1.0 + (n - 1.0) * prob;
    let low = order.floor().max(1.0);
    let high = (low + 1.0).min(n);
    let frac = order - order.floor();

    let cum_weights: Vec<f64> = agg_weights
        .iter()
        .scan(0.0, |acc, &w| {
            *acc += w;
            Some(*acc)
        })
        .collect();

    let allq_low = step_interp_right(&cum_weights, &unique_x, low);
    let allq_high = step_interp_right(&cum_weights, &unique_x, high);

    (1.0 - frac) * allq_low + frac * allq_high
}

/// Step interpolation matching R's approx(method='constant', f=1, rule=2)
fn step_interp_right(xs: &[f64], ys: &[f64], xout: f64) -> f64 {
    let n = xs.len();
    if n == 0 {
        return 0.0;
    }
    if xout <= xs[0] {
        return ys[0];
    }
    if xout >= xs[n - 1] {
        return ys[n - 1];
    }
    xs.iter()
        .position(|&x| x >= xout)
        .map(|i| ys[i])
        .unwrap_or(ys[n - 1])
}

/// Two-sided normal quantile for an upper-tail width, i.e. qnorm(1 - q/2)
pub fn upper_normal_quantile(upper_quantile: f64) -> f64 {
    match Normal::new(0.0, 1.0) {
        Ok(normal) => normal.inverse_cdf(1.0 - upper_quantile / 2.0),
        Err(_) => f64::NAN,
    }
}

/// Match weighted upper quantile for variance estimation.
/// R equivalent: matchWeightedUpperQuantileForVariance() in core.R
///
///   sdEst = wtd.quantile(abs(x), weights, 1 - upperQuantile) / qnorm(1 - upperQuantile/2)
///   return sdEst^2
pub fn match_weighted_upper_quantile_for_variance(x: &[f64], weights: &[f64], upper_quantile: f64) -> f64 {
    let abs_x: Vec<f64> = x.iter().map(|&v| v.abs()).collect();
    let wtd_q = weighted_quantile(&abs_x, weights, 1.0 - upper_quantile);
    let sd_est = wtd_q / upper_normal_quantile(upper_quantile);
    log::debug!("weighted upper quantile={:.6}, sdEst={:.6}", wtd_q, sd_est);

    let var_est = sd_est * sd_est;
    if var_est <= 0.0 || !var_est.is_finite() {
        MIN_PRIOR_VARIANCE
    } else {
        var_est
    }
}

/// Lower tail of a centered normal, NaN when the scale is unusable
pub fn normal_lower_tail(x: f64, sd: f64) -> f64 {
    if !(sd.is_finite() && sd > 0.0) || !x.is_finite() {
        return f64::NAN;
    }
    match Normal::new(0.0, sd) {
        Ok(normal) => normal.cdf(x),
        Err(_) => f64::NAN,
    }
}

/// Log density of a normal distribution
pub fn normal_ln_pdf(x: f64, mean: f64, sd: f64) -> f64 {
    if sd <= 0.0 {
        return f64::NEG_INFINITY;
    }
    let z = (x - mean) / sd;
    -0.5 * z * z - sd.ln() - 0.5 * (2.0 * std::f64::consts::PI).ln()
}

/// s-values from (local) false sign rates.
///
/// Running mean of the sorted rates mapped back to input order; NaN rates stay
/// NaN and sort last. R: `(cumsum(sort(lfsr)) / seq_along(lfsr))[rank(lfsr)]`
pub fn svalue(fsr: &[f64]) -> Vec<f64> {
    let n = fsr.len();
    let mut indices: Vec<usize> = (0..n).collect();
    indices.sort_by(|&a, &b| match (fsr[a].is_nan(), fsr[b].is_nan()) {
        (true, true) => std::cmp::Ordering::Equal,
        (true, false) => std::cmp::Ordering::Greater,
        (false, true) => std::cmp::Ordering::Less,
        (false, false) => fsr[a].partial_cmp(&fsr[b]).unwrap_or(std::cmp::Ordering::Equal),
    });

    let mut result = vec![f64::NAN; n];
    let mut cumsum = 0.0;
    for (rank, &idx) in indices.iter().enumerate() {
        if fsr[idx].is_nan() {
            break;
        }
        cumsum += fsr[idx];
        result[idx] = cumsum / (rank + 1) as f64;
    }
    result
}
