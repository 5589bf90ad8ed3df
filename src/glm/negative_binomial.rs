//! Negative binomial mean/weight helpers for IRLS

/// Minimum mu during GLM fitting (DESeq2's minmu), applied before weights are computed
pub const MIN_MU: f64 = 0.5;

/// Largest |beta| IRLS accepts before handing the row to the optim fallback.
/// DESeq2's `large` = 30 in fitBeta, roughly log2(10^9).
pub const MAX_LFC_BETA: f64 = 30.0;

/// Maximum eta value to prevent overflow (exp(700) ≈ 1e304)
pub const MAX_ETA: f64 = 700.0;

/// NB mean from a natural-log linear predictor and a normalization factor:
/// mu = nf * exp(eta)
pub fn nb_mean(eta: f64, normalization: f64) -> f64 {
    normalization * eta.clamp(-MAX_ETA, MAX_ETA).exp()
}

/// IRLS working weight W = mu / (1 + alpha * mu); mu should already be floored at MIN_MU
pub fn nb_weight(mu: f64, alpha: f64) -> f64 {
    mu / (1.0 + alpha * mu)
}
