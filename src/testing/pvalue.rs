//! P-value calculation from test statistics

use crate::stats::normal_lower_tail;

/// Two-sided p-value from a z-statistic
/// R equivalent: 2 * pnorm(abs(stat), lower.tail=FALSE) in nbinomWaldTest()
pub fn calculate_pvalue(z: f64) -> f64 {
    if !z.is_finite() {
        return f64::NAN;
    }
    (2.0 * normal_lower_tail(-z.abs(), 1.0)).min(1.0)
}
