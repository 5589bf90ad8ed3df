//! Adaptive shrinkage (Stephens 2017, "False discovery rates: a new deal")
//!
//! Effects are modelled as draws from a mixture of zero-centred normals (plus
//! an optional point mass at zero) on a data-adaptive grid of SDs. Mixture
//! weights come from EM with ashr's null-biased Dirichlet prior; posterior
//! mean, SD and local false sign rate follow per feature.
//!
//! R's ashr solves for the weights with an interior point method (mixIP) by
//! default; this is its mixEM path. Both maximise the same penalised
//! likelihood.

use rayon::prelude::*;

use super::backend::{arg_bool, arg_f64, arg_usize, builtin_identity, BackendArgs};
use super::nonparametric::{MixtureSummary, NonparametricEstimator, NonparametricFit};
use crate::error::{Result, ShrinkError};
use crate::stats;

/// Tuning of the ash fit; any field can be overridden from `backend_args`
#[derive(Debug, Clone, PartialEq)]
pub struct AshrParams {
    /// Ratio between neighbouring grid SDs. R: mixsd grid mult = sqrt(2)
    pub grid_multiplier: f64,
    /// Include a point mass at zero
    pub pointmass: bool,
    /// Dirichlet prior weight on the null component. R: nullweight
    pub null_weight: f64,
    pub max_iter: usize,
    /// Largest change of any mixture weight at convergence
    pub tol: f64,
}

impl Default for AshrParams {
    fn default() -> Self {
        Self {
            grid_multiplier: std::f64::consts::SQRT_2,
            pointmass: true,
            null_weight: 10.0,
            max_iter: 1000,
            tol: 1e-6,
        }
    }
}

impl AshrParams {
    /// Overlay `args`; unrecognised keys are returned, not rejected
    pub fn with_args(&self, args: &BackendArgs) -> Result<(Self, Vec<String>)> {
        let mut params = self.clone();
        let mut unknown = Vec::new();
        for (key, value) in args {
            match key.as_str() {
                "grid_multiplier" => params.grid_multiplier = arg_f64(key, value)?,
                "pointmass" => params.pointmass = arg_bool(key, value)?,
                "null_weight" => params.null_weight = arg_f64(key, value)?,
                "max_iter" => params.max_iter = arg_usize(key, value)?,
                "tol" => params.tol = arg_f64(key, value)?,
                _ => unknown.push(key.clone()),
            }
        }
        if params.grid_multiplier <= 1.0 || params.null_weight < 1.0 || params.max_iter == 0 {
            return Err(ShrinkError::InvalidInput {
                reason: "grid_multiplier must exceed 1, null_weight be at least 1 and max_iter positive".to_string(),
            });
        }
        Ok((params, unknown))
    }
}

/// Built-in nonparametric estimator
#[derive(Debug, Clone, Default)]
pub struct AshEstimator {
    params: AshrParams,
}

impl AshEstimator {
    pub fn new(params: AshrParams) -> Self {
        Self { params }
    }
}

impl NonparametricEstimator for AshEstimator {
    fn identity(&self) -> String {
        builtin_identity("ashr")
    }

    fn fit(&self, betahat: &[f64], sebetahat: &[f64], args: &BackendArgs) -> Result<NonparametricFit> {
        let (params, unknown) = self.params.with_args(args)?;
        if !unknown.is_empty() {
            log::warn!("Ignoring unknown ashr arguments: {}", unknown.join(", "));
        }
        if betahat.len() != sebetahat.len() {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{} standard errors", betahat.len()),
                got: format!("{}", sebetahat.len()),
            });
        }

        let n = betahat.len();
        let used: Vec<usize> = (0..n)
            .filter(|&i| betahat[i].is_finite() && sebetahat[i].is_finite() && sebetahat[i] > 0.0)
            .collect();
        if used.is_empty() {
            return Err(ShrinkError::DegenerateModel {
                reason: "no feature has a finite effect and a positive standard error".to_string(),
            });
        }
        let b: Vec<f64> = used.iter().map(|&i| betahat[i]).collect();
        let s: Vec<f64> = used.iter().map(|&i| sebetahat[i]).collect();

        let sd = mixture_grid(&b, &s, &params);
        let log_lik = log_likelihood_matrix(&b, &s, &sd);
        let em = fit_weights(&log_lik, &sd, &params);
        log::debug!(
            "ash: {} components, {} EM iterations, log-likelihood {:.4}",
            sd.len(),
            em.iterations,
            em.log_likelihood
        );

        let mut posterior_mean = vec![f64::NAN; n];
        let mut posterior_sd = vec![f64::NAN; n];
        let mut lfsr = vec![f64::NAN; n];
        for (k, &i) in used.iter().enumerate() {
            let post = posterior(b[k], s[k], &sd, &em.pi);
            posterior_mean[i] = post.mean;
            posterior_sd[i] = post.sd;
            lfsr[i] = post.lfsr;
        }

        Ok(NonparametricFit {
            svalue: stats::svalue(&lfsr),
            posterior_mean,
            posterior_sd,
            lfsr,
            mixture: MixtureSummary { sd, pi: em.pi },
            log_likelihood: em.log_likelihood,
            converged: em.converged,
        })
    }
}

/// Grid of component SDs. R: ashr:::autoselect.mixsd
///
/// From `min(se) / 10` up to `2 * sqrt(max(betahat^2 - se^2))` (or 8 times the
/// minimum when no effect exceeds its noise), geometric with ratio `mult`,
/// plus 0 for the point mass.
fn mixture_grid(betahat: &[f64], sebetahat: &[f64], params: &AshrParams) -> Vec<f64> {
    let sd_min = sebetahat.iter().copied().fold(f64::INFINITY, f64::min) / 10.0;
    let excess = betahat
        .iter()
        .zip(sebetahat)
        .map(|(b, s)| b * b - s * s)
        .fold(f64::NEG_INFINITY, f64::max);
    let sd_max = if excess <= 0.0 { 8.0 * sd_min } else { 2.0 * excess.sqrt() };

    let mult = params.grid_multiplier;
    let npoint = ((sd_max / sd_min).log2() / mult.log2()).ceil().max(0.0) as i32;
    let mut grid: Vec<f64> = Vec::with_capacity(npoint as usize + 2);
    if params.pointmass {
        grid.push(0.0);
    }
    grid.extend((-npoint..=0).map(|p| sd_max * mult.powi(p)));
    grid
}

/// log N(betahat_i; 0, se_i^2 + sd_k^2), features x components
fn log_likelihood_matrix(betahat: &[f64], sebetahat: &[f64], sd: &[f64]) -> Vec<Vec<f64>> {
    betahat
        .par_iter()
        .zip(sebetahat.par_iter())
        .map(|(&b, &s)| {
            sd.iter()
                .map(|&sk| stats::normal_ln_pdf(b, 0.0, (s * s + sk * sk).sqrt()))
                .collect()
        })
        .collect()
}

struct EmFit {
    pi: Vec<f64>,
    log_likelihood: f64,
    iterations: usize,
    converged: bool,
}

/// log sum_k pi_k exp(ll_k) and the normalised responsibilities
fn responsibilities(ll: &[f64], pi: &[f64]) -> (f64, Vec<f64>) {
    let terms: Vec<f64> = ll
        .iter()
        .zip(pi)
        .map(|(l, p)| if *p > 0.0 { p.ln() + l } else { f64::NEG_INFINITY })
        .collect();
    let max = terms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return (f64::NEG_INFINITY, vec![0.0; ll.len()]);
    }
    let log_marginal = max + terms.iter().map(|t| (t - max).exp()).sum::<f64>().ln();
    (log_marginal, terms.iter().map(|t| (t - log_marginal).exp()).collect())
}

/// EM for the mixture weights under a Dirichlet(null_weight, 1, ..., 1) prior.
/// R: ashr:::mixEM with prior = "nullbiased"
fn fit_weights(log_lik: &[Vec<f64>], sd: &[f64], params: &AshrParams) -> EmFit {
    let k = sd.len();
    let prior: Vec<f64> = sd
        .iter()
        .map(|&s| if s == 0.0 { params.null_weight } else { 1.0 })
        .collect();
    let prior_excess: f64 = prior.iter().map(|a| a - 1.0).sum();
    let n = log_lik.len() as f64;

    let mut pi = vec![1.0 / k as f64; k];
    let mut log_likelihood = f64::NEG_INFINITY;
    for iteration in 1..=params.max_iter {
        let (ll, counts) = log_lik
            .par_iter()
            .map(|row| responsibilities(row, &pi))
            .fold(
                || (0.0, vec![0.0; k]),
                |(ll, mut acc), (lm, r)| {
                    acc.iter_mut().zip(&r).for_each(|(a, v)| *a += v);
                    (ll + lm, acc)
                },
            )
            .reduce(
                || (0.0, vec![0.0; k]),
                |(la, mut a), (lb, b)| {
                    a.iter_mut().zip(&b).for_each(|(x, y)| *x += y);
                    (la + lb, a)
                },
            );
        log_likelihood = ll;

        let updated: Vec<f64> = counts
            .iter()
            .zip(&prior)
            .map(|(c, a)| (c + a - 1.0) / (n + prior_excess))
            .collect();
        let change = pi.iter().zip(&updated).map(|(a, b)| (a - b).abs()).fold(0.0, f64::max);
        pi = updated;
        if change < params.tol {
            return EmFit {
                pi,
                log_likelihood,
                iterations: iteration,
                converged: true,
            };
        }
    }
    EmFit {
        pi,
        log_likelihood,
        iterations: params.max_iter,
        converged: false,
    }
}

struct Posterior {
    mean: f64,
    sd: f64,
    lfsr: f64,
}

/// Posterior of one effect under the fitted mixture
fn posterior(b: f64, s: f64, sd: &[f64], pi: &[f64]) -> Posterior {
    let ll: Vec<f64> = sd
        .iter()
        .map(|&sk| stats::normal_ln_pdf(b, 0.0, (s * s + sk * sk).sqrt()))
        .collect();
    let (_, weight) = responsibilities(&ll, pi);

    let (mut mean, mut second, mut negative, mut zero) = (0.0, 0.0, 0.0, 0.0);
    for (&sk, &w) in sd.iter().zip(&weight) {
        if sk == 0.0 {
            zero += w;
            continue;
        }
        let shrink = sk * sk / (sk * sk + s * s);
        let mu = shrink * b;
        let var = shrink * s * s;
        mean += w * mu;
        second += w * (var + mu * mu);
        negative += w * stats::normal_lower_tail(-mu, var.sqrt());
    }

    // R: ashr:::compute_lfsr
    let lfsr = if negative > 0.5 * (1.0 - zero) {
        1.0 - negative
    } else {
        negative + zero
    };
    Posterior {
        mean,
        sd: (second - mean * mean).max(0.0).sqrt(),
        lfsr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn data() -> (Vec<f64>, Vec<f64>) {
        let mut b = Vec::new();
        let mut s = Vec::new();
        for i in 0..40 {
            let noise = ((i * 37) % 11) as f64 / 11.0 - 0.5;
            b.push(0.3 * noise);
            s.push(0.3 + 0.01 * (i % 5) as f64);
        }
        b.extend([3.0, -2.5, 4.0]);
        s.extend([0.3, 0.3, 0.3]);
        (b, s)
    }

    #[test]
    fn test_grid_spans_noise_and_signal() {
        let (b, s) = data();
        let grid = mixture_grid(&b, &s, &AshrParams::default());
        assert_eq!(grid[0], 0.0);
        assert_abs_diff_eq!(*grid.last().unwrap(), 2.0 * (16.0f64 - 0.09).sqrt(), epsilon = 1e-12);
        assert!(grid[1] <= 0.03 + 1e-12);
        assert!(grid.windows(2).all(|w| w[0] < w[1]));

        let flat = mixture_grid(&[0.0, 0.1], &[1.0, 1.0], &AshrParams::default());
        assert_abs_diff_eq!(*flat.last().unwrap(), 0.8, epsilon = 1e-12);
    }

    #[test]
    fn test_em_weights_sum_to_one() {
        let (b, s) = data();
        let params = AshrParams::default();
        let sd = mixture_grid(&b, &s, &params);
        let em = fit_weights(&log_likelihood_matrix(&b, &s, &sd), &sd, &params);
        assert_abs_diff_eq!(em.pi.iter().sum::<f64>(), 1.0, epsilon = 1e-10);
        assert!(em.pi.iter().all(|&p| p >= 0.0));
        assert!(em.log_likelihood.is_finite());
        // Mostly noise: the point mass carries the most weight
        assert!(em.pi[0] > 0.3, "pi0 {}", em.pi[0]);
    }

    #[test]
    fn test_shrinkage_is_adaptive() {
        let (b, s) = data();
        let fit = AshEstimator::default().fit(&b, &s, &BackendArgs::new()).unwrap();

        // Noise is pulled hard toward zero, strong effects barely move
        for i in 0..40 {
            assert!(fit.posterior_mean[i].abs() <= b[i].abs() + 1e-12);
        }
        assert!(fit.posterior_mean[40] > 2.5 && fit.posterior_mean[40] <= 3.0);
        assert!(fit.posterior_mean[41] < -2.0);
        assert!(fit.lfsr[42] < 1e-3);
        assert!(fit.lfsr[0] > 0.1);
        assert!(fit.svalue[42] <= fit.svalue[0]);
    }

    #[test]
    fn test_unusable_rows_are_nan() {
        let b = vec![1.0, f64::NAN, 0.5, 2.0];
        let s = vec![0.5, 0.5, 0.0, 0.4];
        let fit = AshEstimator::new(AshrParams::default()).fit(&b, &s, &BackendArgs::new()).unwrap();
        assert!(fit.posterior_mean[1].is_nan());
        assert!(fit.posterior_mean[2].is_nan());
        assert!(fit.svalue[2].is_nan());
        assert!(fit.posterior_mean[3].is_finite());

        let none = AshEstimator::default().fit(&[f64::NAN], &[1.0], &BackendArgs::new());
        assert!(matches!(none, Err(ShrinkError::DegenerateModel { .. })));
    }

    #[test]
    fn test_lfsr_with_point_mass_only() {
        // Everything at the point mass: no sign can be trusted
        let post = posterior(0.2, 1.0, &[0.0, 1.0], &[1.0, 0.0]);
        assert_eq!(post.mean, 0.0);
        assert_eq!(post.sd, 0.0);
        assert_abs_diff_eq!(post.lfsr, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_args_overlay() {
        let mut args = BackendArgs::new();
        args.insert("pointmass".to_string(), serde_json::json!(false));
        let (params, unknown) = AshrParams::default().with_args(&args).unwrap();
        assert!(!params.pointmass);
        assert!(unknown.is_empty());

        args.insert("grid_multiplier".to_string(), serde_json::json!(1.0));
        assert!(AshrParams::default().with_args(&args).is_err());
    }
}
