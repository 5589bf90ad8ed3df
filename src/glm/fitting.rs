//! Ridge-penalised negative binomial GLM fitting (IRLS with an L-BFGS-B fallback)
//!
//! Every fit in this crate goes through [`RidgeFitter`]: the unpenalised MLE
//! uses the wide default penalty of 1e-6 per coefficient, the normal-prior
//! shrinkage uses `1 / priorVar`. Penalties are given on the log2 scale and
//! converted to the natural-log scale the IRLS works in
//! (`lambda_nat = lambda_log2 / ln(2)^2`). Results are reported on log2.

use std::f64::consts::{LN_2, LOG2_E};
use std::ops::Range;

use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use statrs::function::gamma::ln_gamma;

use super::negative_binomial::{nb_mean, nb_weight, MAX_ETA, MAX_LFC_BETA, MIN_MU};
use crate::data::{CoefficientFit, FitKind, FittedModel};
use crate::error::{Result, ShrinkError};

/// Default ridge penalty (log2 scale) of an "unpenalised" fit. R: lambda = 1e-6
pub const WIDE_PRIOR_LAMBDA: f64 = 1e-6;

/// Configurable parameters for GLM fitting.
/// R equivalent: parameters of nbinomWaldTest() in core.R
#[derive(Debug, Clone)]
pub struct GlmFitParams {
    /// Maximum IRLS iterations. R: nbinomWaldTest(maxit=100)
    pub maxit: usize,
    /// Deviance convergence tolerance. R: nbinomWaldTest(betaTol=1e-8)
    pub beta_tol: f64,
}

impl Default for GlmFitParams {
    fn default() -> Self {
        Self {
            maxit: 100,
            beta_tol: 1e-8,
        }
    }
}

/// Everything a ridge refit reads, as borrowed views over the model.
#[derive(Debug, Clone)]
pub struct RidgeFitInput<'a> {
    /// genes x samples
    pub counts: ArrayView2<'a, f64>,
    /// genes x samples normalization (size factors broadcast or normalization factors)
    pub normalization: ArrayView2<'a, f64>,
    /// samples x coefficients
    pub design: ArrayView2<'a, f64>,
    pub dispersions: ArrayView1<'a, f64>,
    /// genes x samples observation weights, all ones when absent
    pub weights: Option<ArrayView2<'a, f64>>,
    /// Per-coefficient penalty on the log2 scale
    pub lambda_log2: &'a [f64],
}

impl<'a> RidgeFitInput<'a> {
    pub fn n_genes(&self) -> usize {
        self.counts.nrows()
    }

    /// The same problem restricted to a contiguous block of genes
    pub fn rows(&self, range: Range<usize>) -> RidgeFitInput<'a> {
        RidgeFitInput {
            counts: self.counts.slice_move(s![range.clone(), ..]),
            normalization: self.normalization.slice_move(s![range.clone(), ..]),
            design: self.design,
            dispersions: self.dispersions.slice_move(s![range.clone()]),
            weights: self.weights.map(|w| w.slice_move(s![range, ..])),
            lambda_log2: self.lambda_log2,
        }
    }

    fn validate(&self) -> Result<()> {
        let (n_genes, n_samples) = self.counts.dim();
        if self.normalization.dim() != (n_genes, n_samples) {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{}x{} normalization", n_genes, n_samples),
                got: format!("{:?}", self.normalization.dim()),
            });
        }
        if self.design.nrows() != n_samples {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{} design rows", n_samples),
                got: format!("{}", self.design.nrows()),
            });
        }
        if self.dispersions.len() != n_genes {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{} dispersions", n_genes),
                got: format!("{}", self.dispersions.len()),
            });
        }
        if self.lambda_log2.len() != self.design.ncols() {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{} penalties", self.design.ncols()),
                got: format!("{}", self.lambda_log2.len()),
            });
        }
        if let Some(w) = &self.weights {
            if w.dim() != (n_genes, n_samples) {
                return Err(ShrinkError::DimensionMismatch {
                    expected: format!("{}x{} weights", n_genes, n_samples),
                    got: format!("{:?}", w.dim()),
                });
            }
        }
        Ok(())
    }
}

/// Output of a ridge fit, log2 scale, one row per input gene in input order.
#[derive(Debug, Clone)]
pub struct RidgeFit {
    pub coefficients: Array2<f64>,
    pub standard_errors: Array2<f64>,
    /// Sandwich covariance per gene
    pub covariances: Array3<f64>,
    pub converged: Vec<bool>,
}

impl RidgeFit {
    pub fn n_genes(&self) -> usize {
        self.coefficients.nrows()
    }

    /// Concatenate fits of consecutive gene blocks
    pub fn concat(parts: Vec<RidgeFit>) -> Result<RidgeFit> {
        let n_coefs = parts.first().map(|p| p.coefficients.ncols()).unwrap_or(0);
        let coef_views: Vec<_> = parts.iter().map(|p| p.coefficients.view()).collect();
        let se_views: Vec<_> = parts.iter().map(|p| p.standard_errors.view()).collect();
        let cov_views: Vec<_> = parts.iter().map(|p| p.covariances.view()).collect();

        let concat_err = |e: ndarray::ShapeError| ShrinkError::DimensionMismatch {
            expected: format!("partition fits with {} coefficients", n_coefs),
            got: e.to_string(),
        };
        Ok(RidgeFit {
            coefficients: ndarray::concatenate(Axis(0), &coef_views).map_err(concat_err)?,
            standard_errors: ndarray::concatenate(Axis(0), &se_views).map_err(concat_err)?,
            covariances: ndarray::concatenate(Axis(0), &cov_views).map_err(concat_err)?,
            converged: parts.iter().flat_map(|p| p.converged.iter().copied()).collect(),
        })
    }
}

/// A GLM fitter that accepts a per-coefficient ridge penalty.
/// R equivalent: fitNbinomGLMs() with a lambda argument
pub trait RidgeFitter: Send + Sync {
    fn fit(&self, input: &RidgeFitInput<'_>) -> Result<RidgeFit>;
}

/// IRLS fitter matching DESeq2's fitBeta, with the optim() fallback for rows
/// that fail to converge.
#[derive(Debug, Clone, Default)]
pub struct IrlsRidgeFitter {
    pub params: GlmFitParams,
}

impl IrlsRidgeFitter {
    pub fn new(params: GlmFitParams) -> Self {
        Self { params }
    }
}

impl RidgeFitter for IrlsRidgeFitter {
    fn fit(&self, input: &RidgeFitInput<'_>) -> Result<RidgeFit> {
        input.validate()?;
        let n_genes = input.n_genes();
        let n_coefs = input.design.ncols();
        let lambda_nat: Vec<f64> = input.lambda_log2.iter().map(|&l| l / (LN_2 * LN_2)).collect();
        let design = input.design.to_owned();

        let results: Vec<GeneFit> = (0..n_genes)
            .into_par_iter()
            .map(|i| {
                let problem = GeneProblem {
                    counts: input.counts.row(i),
                    normalization: input.normalization.row(i),
                    weights: input.weights.as_ref().map(|w| w.row(i)),
                    alpha: input.dispersions[i],
                    design: &design,
                    lambda: &lambda_nat,
                };
                problem.fit(&self.params)
            })
            .collect();

        let mut coefficients = Array2::zeros((n_genes, n_coefs));
        let mut standard_errors = Array2::zeros((n_genes, n_coefs));
        let mut covariances = Array3::zeros((n_genes, n_coefs, n_coefs));
        let mut converged = Vec::with_capacity(n_genes);

        for (i, result) in results.into_iter().enumerate() {
            for j in 0..n_coefs {
                coefficients[[i, j]] = result.beta[j] * LOG2_E;
                standard_errors[[i, j]] = result.sigma[j * n_coefs + j].sqrt() * LOG2_E;
                for k in 0..n_coefs {
                    covariances[[i, j, k]] = result.sigma[j * n_coefs + k] * LOG2_E * LOG2_E;
                }
            }
            converged.push(result.converged);
        }

        let n_failed = converged.iter().filter(|&&c| !c).count();
        if n_failed > 0 {
            log::debug!("{} of {} rows did not converge in the ridge fit", n_failed, n_genes);
        }

        Ok(RidgeFit {
            coefficients,
            standard_errors,
            covariances,
            converged,
        })
    }
}

/// Fit the unpenalised GLM and return a derived model carrying the MLE.
/// R equivalent: nbinomWaldTest(betaPrior=FALSE) coefficient fitting
pub fn fit_mle(model: &FittedModel, fitter: &dyn RidgeFitter) -> Result<FittedModel> {
    let dispersions = model.dispersions().ok_or_else(|| ShrinkError::IncompatibleModelState {
        reason: "dispersions are required to fit the GLM".to_string(),
    })?;
    let normalization = model.normalization_matrix()?;
    let lambda = vec![WIDE_PRIOR_LAMBDA; model.design_matrix().ncols()];

    log::info!("Fitting negative binomial GLM for {} features", model.n_features());
    let fit = fitter.fit(&RidgeFitInput {
        counts: model.count_view(),
        normalization: normalization.view(),
        design: model.design_matrix().view(),
        dispersions: dispersions.view(),
        weights: model.weights().map(|w| w.view()),
        lambda_log2: &lambda,
    })?;

    let coef_fit = CoefficientFit::new(
        FitKind::Mle,
        fit.coefficients,
        fit.standard_errors,
        Some(fit.covariances),
        fit.converged,
        model.design_info(),
    )?;
    model.with_fit(model.design_matrix().clone(), model.design_info().clone(), coef_fit)
}

/// Calculate NB log-likelihood matching R's dnbinom_mu(x, size, mu, log=TRUE)
fn nb_log_density(y: f64, mu: f64, size: f64) -> f64 {
    if mu <= 0.0 || size <= 0.0 {
        return f64::NEG_INFINITY;
    }
    let prob = size / (size + mu);
    ln_gamma(y + size) - ln_gamma(size) - ln_gamma(y + 1.0) + size * prob.ln() + y * (1.0 - prob).ln()
}

struct GeneFit {
    /// natural-log scale
    beta: Vec<f64>,
    /// natural-log scale, row-major n_coefs x n_coefs
    sigma: Vec<f64>,
    converged: bool,
}

impl GeneFit {
    fn missing(n_coefs: usize, converged: bool) -> Self {
        Self {
            beta: vec![f64::NAN; n_coefs],
            sigma: vec![f64::NAN; n_coefs * n_coefs],
            converged,
        }
    }
}

struct GeneProblem<'a> {
    counts: ArrayView1<'a, f64>,
    normalization: ArrayView1<'a, f64>,
    weights: Option<ArrayView1<'a, f64>>,
    alpha: f64,
    design: &'a Array2<f64>,
    /// natural-log scale
    lambda: &'a [f64],
}

impl GeneProblem<'_> {
    fn obs_weight(&self, i: usize) -> f64 {
        self.weights.map(|w| w[i]).unwrap_or(1.0)
    }

    fn eta(&self, i: usize, beta: &[f64]) -> f64 {
        beta.iter().enumerate().map(|(j, &b)| self.design[[i, j]] * b).sum()
    }

    /// IRLS working weights at `beta`, observation weights folded in
    fn irls_weights(&self, beta: &[f64]) -> Vec<f64> {
        (0..self.counts.len())
            .map(|i| {
                let mu = nb_mean(self.eta(i, beta), self.normalization[i]).max(MIN_MU);
                self.obs_weight(i) * nb_weight(mu, self.alpha)
            })
            .collect()
    }

    fn fit(&self, params: &GlmFitParams) -> GeneFit {
        let n_samples = self.counts.len();
        let n_coefs = self.design.ncols();

        // Skipped like DESeq2's allZero rows; reported as NA rather than non-converged
        if self.counts.iter().all(|&c| c == 0.0) {
            return GeneFit::missing(n_coefs, true);
        }
        if !(self.alpha.is_finite() && self.alpha > 0.0) {
            return GeneFit::missing(n_coefs, false);
        }

        let initial_beta = self.ols_start();
        let mut beta = initial_beta.clone();
        let mut converged = false;
        let mut dev_old = 0.0f64;
        let mut response = vec![0.0; n_samples];

        for iter in 0..params.maxit {
            let mut w = vec![0.0; n_samples];
            for i in 0..n_samples {
                let mu = nb_mean(self.eta(i, &beta), self.normalization[i]).max(MIN_MU);
                w[i] = self.obs_weight(i) * nb_weight(mu, self.alpha);
                response[i] = (mu / self.normalization[i]).ln() + (self.counts[i] - mu) / mu;
            }
            let new_beta = self.ridge_wls(&w, &response);

            // R C++: if (sum(abs(beta_hat) > large) > 0) { iter(i) = maxit; break; }
            if new_beta.iter().any(|&b| b.abs() > MAX_LFC_BETA) {
                beta = new_beta;
                break;
            }

            let dev = -2.0 * self.log_likelihood_nat(&new_beta);
            let conv_test = (dev - dev_old).abs() / (dev.abs() + 0.1);
            beta = new_beta;
            if conv_test.is_nan() {
                break;
            }
            if iter > 0 && conv_test < params.beta_tol {
                converged = true;
                break;
            }
            dev_old = dev;
        }

        let row_stable = beta.iter().all(|b| b.is_finite());
        let mut sigma = self.sandwich_covariance(&self.irls_weights(&beta));
        let row_var_positive = (0..n_coefs).all(|j| sigma[j * n_coefs + j] > 0.0);

        // R: rowsForOptim <- which(!betaConv | !rowStable | !rowVarPositive)
        if !converged || !row_stable || !row_var_positive {
            let beta_log2: Vec<f64> = beta.iter().map(|&b| b / LN_2).collect();
            let start = if row_stable && beta_log2.iter().all(|b| b.abs() < MAX_LFC_BETA) {
                beta_log2
            } else {
                initial_beta.iter().map(|&b| b / LN_2).collect()
            };
            let (optimum, optim_converged) = self.optim_fallback(&start);
            beta = optimum.iter().map(|&p| p * LN_2).collect();
            converged = optim_converged;
            sigma = self.sandwich_covariance(&self.irls_weights(&beta));
        }

        GeneFit { beta, sigma, converged }
    }

    /// OLS on log normalized counts. R C++ fitBeta: y_hat(j) = log(k/nf + 0.1)
    fn ols_start(&self) -> Vec<f64> {
        let n_coefs = self.design.ncols();
        let log_counts: Vec<f64> = self
            .counts
            .iter()
            .zip(self.normalization.iter())
            .map(|(&c, &nf)| (c / nf + 0.1).ln())
            .collect();
        let unit = vec![1.0; log_counts.len()];
        let zero_penalty = vec![0.0; n_coefs];
        let beta = weighted_ridge_solve(self.design, &unit, &log_counts, &zero_penalty);

        // Rank-deficient (expanded) designs blow up here; start from the mean instead
        if beta.iter().all(|b| b.is_finite() && b.abs() < MAX_LFC_BETA) {
            return beta;
        }
        let mean_count =
            self.counts.iter().zip(self.normalization.iter()).map(|(&c, &nf)| c / nf).sum::<f64>() / self.counts.len() as f64;
        let mut fallback = vec![0.0; n_coefs];
        fallback[0] = mean_count.max(0.1).ln();
        fallback
    }

    fn ridge_wls(&self, weights: &[f64], response: &[f64]) -> Vec<f64> {
        weighted_ridge_solve(self.design, weights, response, self.lambda)
    }

    /// Weighted log-likelihood with natural-log coefficients
    fn log_likelihood_nat(&self, beta: &[f64]) -> f64 {
        let size = 1.0 / self.alpha;
        (0..self.counts.len())
            .map(|i| {
                let mu = nb_mean(self.eta(i, beta), self.normalization[i]).max(MIN_MU);
                self.obs_weight(i) * nb_log_density(self.counts[i], mu, size)
            })
            .sum()
    }

    /// Negative log posterior in log2 coefficients. R: fitNbinomGLMsOptim objectiveFn
    fn neg_log_posterior_log2(&self, p: &[f64]) -> f64 {
        let size = 1.0 / self.alpha;
        let mut val = 0.0;
        for i in 0..self.counts.len() {
            let eta = (self.eta(i, p) * LN_2).clamp(-MAX_ETA, MAX_ETA);
            let mu = self.normalization[i] * eta.exp();
            val -= self.obs_weight(i) * nb_log_density(self.counts[i], mu, size);
        }
        for (j, &pj) in p.iter().enumerate() {
            val += 0.5 * self.lambda[j] * LN_2 * LN_2 * pj * pj;
        }
        if val.is_finite() {
            val
        } else {
            1e300
        }
    }

    fn optim_fallback(&self, start: &[f64]) -> (Vec<f64>, bool) {
        let n = start.len();
        let bounds = Bounds {
            lower: vec![-MAX_LFC_BETA; n],
            upper: vec![MAX_LFC_BETA; n],
        };
        lbfgsb_minimize(|p| self.neg_log_posterior_log2(p), start, &bounds)
    }

    /// (X'WX + Λ)^-1 X'WX (X'WX + Λ)^-1
    fn sandwich_covariance(&self, weights: &[f64]) -> Vec<f64> {
        let n = self.design.ncols();
        let xtwx = crossprod_weighted(self.design, weights);
        let mut penalised = xtwx.clone();
        for j in 0..n {
            penalised[j * n + j] += self.lambda[j];
        }
        let inv = invert_symmetric_matrix(&penalised, n);
        let left = mat_mul(&inv, &xtwx, n);
        mat_mul(&left, &inv, n)
    }
}

fn crossprod_weighted(design: &Array2<f64>, weights: &[f64]) -> Vec<f64> {
    let n = design.ncols();
    let mut xtwx = vec![0.0; n * n];
    for (i, &w) in weights.iter().enumerate() {
        for j in 0..n {
            let xj = w * design[[i, j]];
            for k in 0..n {
                xtwx[j * n + k] += xj * design[[i, k]];
            }
        }
    }
    xtwx
}

fn mat_mul(a: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    let mut out = vec![0.0; n * n];
    for i in 0..n {
        for k in 0..n {
            let aik = a[i * n + k];
            for j in 0..n {
                out[i * n + j] += aik * b[k * n + j];
            }
        }
    }
    out
}

/// Solve (X'WX + diag(lambda)) beta = X'Wz
fn weighted_ridge_solve(design: &Array2<f64>, weights: &[f64], response: &[f64], lambda: &[f64]) -> Vec<f64> {
    let n = design.ncols();
    let mut xtwx = crossprod_weighted(design, weights);
    for j in 0..n {
        xtwx[j * n + j] += lambda[j];
    }
    let mut xtwz = vec![0.0; n];
    for (i, (&w, &z)) in weights.iter().zip(response.iter()).enumerate() {
        for j in 0..n {
            xtwz[j] += w * design[[i, j]] * z;
        }
    }
    solve_symmetric_system(&xtwx, &xtwz, n)
}

/// Cholesky solve; non-positive pivots are floored at 1e-12
fn solve_symmetric_system(a: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    let mut l = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                l[i * n + j] = sum.max(1e-12).sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }

    let mut y = vec![0.0; n];
    for i in 0..n {
        let sum: f64 = b[i] - (0..i).map(|j| l[i * n + j] * y[j]).sum::<f64>();
        y[i] = sum / l[i * n + i];
    }
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let sum: f64 = y[i] - ((i + 1)..n).map(|j| l[j * n + i] * x[j]).sum::<f64>();
        x[i] = sum / l[i * n + i];
    }
    x
}

fn invert_symmetric_matrix(a: &[f64], n: usize) -> Vec<f64> {
    let mut result = vec![0.0; n * n];
    for i in 0..n {
        let mut e = vec![0.0; n];
        e[i] = 1.0;
        let col = solve_symmetric_system(a, &e, n);
        for j in 0..n {
            result[j * n + i] = col[j];
        }
    }
    result
}

// ==========================================================================
// Box-constrained L-BFGS for the optim() fallback
// ==========================================================================

struct Bounds {
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl Bounds {
    /// Distance from a bound, relative, at which a coordinate counts as on it
    const ACTIVE_TOL: f64 = 1e-10;

    fn project(&self, x: &mut [f64]) {
        for (j, xj) in x.iter_mut().enumerate() {
            *xj = xj.clamp(self.lower[j], self.upper[j]);
        }
    }

    fn at_lower(&self, x: &[f64], j: usize) -> bool {
        x[j] <= self.lower[j] + Self::ACTIVE_TOL * (1.0 + self.lower[j].abs())
    }

    fn at_upper(&self, x: &[f64], j: usize) -> bool {
        x[j] >= self.upper[j] - Self::ACTIVE_TOL * (1.0 + self.upper[j].abs())
    }

    /// Zero direction components that push against an active bound
    fn mask(&self, x: &[f64], d: &mut [f64]) {
        for j in 0..x.len() {
            if (self.at_lower(x, j) && d[j] < 0.0) || (self.at_upper(x, j) && d[j] > 0.0) {
                d[j] = 0.0;
            }
        }
    }

    fn projected_gradient_inf(&self, x: &[f64], grad: &[f64]) -> f64 {
        (0..x.len())
            .map(|j| {
                let blocked = (self.at_lower(x, j) && grad[j] > 0.0) || (self.at_upper(x, j) && grad[j] < 0.0);
                if blocked {
                    0.0
                } else {
                    grad[j].abs()
                }
            })
            .fold(0.0, f64::max)
    }
}

/// Central differences, step relative to the coordinate
fn numeric_gradient(f: &impl Fn(&[f64]) -> f64, x: &[f64]) -> Vec<f64> {
    let mut work = x.to_vec();
    (0..x.len())
        .map(|j| {
            let orig = work[j];
            let h = 1e-6 * (1.0 + orig.abs());
            work[j] = orig + h;
            let f_plus = f(&work);
            work[j] = orig - h;
            let f_minus = f(&work);
            work[j] = orig;
            (f_plus - f_minus) / (2.0 * h)
        })
        .collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L-BFGS two-loop recursion: H * grad for the (s, y, 1/s'y) history, oldest first
pub(crate) fn two_loop_direction(grad: &[f64], history: &std::collections::VecDeque<(Vec<f64>, Vec<f64>, f64)>) -> Vec<f64> {
    let mut q = grad.to_vec();
    let Some((s_last, y_last, _)) = history.back() else {
        return q;
    };
    let mut alphas = Vec::with_capacity(history.len());
    for (s, y, rho) in history.iter().rev() {
        let a = rho * dot(s, &q);
        for (qj, yj) in q.iter_mut().zip(y.iter()) {
            *qj -= a * yj;
        }
        alphas.push(a);
    }
    let yy = dot(y_last, y_last);
    let gamma = if yy > 0.0 { dot(s_last, y_last) / yy } else { 1.0 };
    let mut r: Vec<f64> = q.iter().map(|&v| gamma * v).collect();
    for ((s, y, rho), a) in history.iter().zip(alphas.iter().rev()) {
        let b = rho * dot(y, &r);
        for (rj, sj) in r.iter_mut().zip(s.iter()) {
            *rj += sj * (a - b);
        }
    }
    r
}

/// Projected L-BFGS: quasi-Newton direction on the free coordinates, then a
/// backtracking Armijo search along the projected path `P(x + step * d)`.
/// Converged only when the projected gradient vanishes (relative to `f`).
fn lbfgsb_minimize(f: impl Fn(&[f64]) -> f64, start: &[f64], bounds: &Bounds) -> (Vec<f64>, bool) {
    const MEMORY: usize = 6;
    const MAX_ITER: usize = 100;
    const MAX_LINESEARCH: usize = 50;
    const GRAD_TOL: f64 = 1e-6;
    const C1: f64 = 1e-4;

    let mut x = start.to_vec();
    bounds.project(&mut x);
    let mut fx = f(&x);
    let mut grad = numeric_gradient(&f, &x);
    let mut history = std::collections::VecDeque::with_capacity(MEMORY);
    let stationary =
        |x: &[f64], grad: &[f64], fx: f64| bounds.projected_gradient_inf(x, grad) <= GRAD_TOL * (1.0 + fx.abs());

    for _ in 0..MAX_ITER {
        if stationary(&x, &grad, fx) {
            return (x, true);
        }

        let mut d: Vec<f64> = two_loop_direction(&grad, &history).iter().map(|v| -v).collect();
        bounds.mask(&x, &mut d);
        if dot(&grad, &d) >= 0.0 {
            d = grad.iter().map(|g| -g).collect();
            bounds.mask(&x, &mut d);
        }
        if dot(&grad, &d) >= 0.0 {
            break;
        }

        let mut step = 1.0;
        let mut accepted = None;
        for _ in 0..MAX_LINESEARCH {
            let mut x_new: Vec<f64> = x.iter().zip(&d).map(|(xj, dj)| xj + step * dj).collect();
            bounds.project(&mut x_new);
            // first-order change along the projected path
            let decrease: f64 = grad
                .iter()
                .zip(x_new.iter().zip(&x))
                .map(|(g, (a, b))| g * (a - b))
                .sum();
            if decrease < 0.0 {
                let f_new = f(&x_new);
                if f_new <= fx + C1 * decrease {
                    accepted = Some((x_new, f_new));
                    break;
                }
            }
            step *= 0.5;
        }

        let Some((x_new, f_new)) = accepted else {
            if history.is_empty() {
                break;
            }
            // restart from steepest descent
            history.clear();
            continue;
        };

        let grad_new = numeric_gradient(&f, &x_new);
        let s_vec: Vec<f64> = x_new.iter().zip(x.iter()).map(|(a, b)| a - b).collect();
        let y_vec: Vec<f64> = grad_new.iter().zip(grad.iter()).map(|(a, b)| a - b).collect();
        let sy = dot(&s_vec, &y_vec);
        if sy > 1e-20 {
            if history.len() == MEMORY {
                history.pop_front();
            }
            history.push_back((s_vec, y_vec, 1.0 / sy));
        }

        x = x_new;
        fx = f_new;
        grad = grad_new;
    }
    let converged = stationary(&x, &grad, fx);
    (x, converged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1};

    fn two_group_input_data() -> (Array2<f64>, Array2<f64>, Array2<f64>, Array1<f64>) {
        let counts = array![
            [100.0, 110.0, 95.0, 400.0, 420.0, 380.0],
            [50.0, 48.0, 52.0, 51.0, 49.0, 50.0],
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        ];
        let norm = Array2::ones((3, 6));
        let design = array![[1.0, 0.0], [1.0, 0.0], [1.0, 0.0], [1.0, 1.0], [1.0, 1.0], [1.0, 1.0]];
        let disp = array![0.01, 0.01, 0.1];
        (counts, norm, design, disp)
    }

    #[test]
    fn test_irls_recovers_fold_change() {
        let (counts, norm, design, disp) = two_group_input_data();
        let lambda = vec![WIDE_PRIOR_LAMBDA; 2];
        let input = RidgeFitInput {
            counts: counts.view(),
            normalization: norm.view(),
            design: design.view(),
            dispersions: disp.view(),
            weights: None,
            lambda_log2: &lambda,
        };
        let fit = IrlsRidgeFitter::default().fit(&input).unwrap();

        // group means 101.67 vs 400 -> log2 ratio ~1.977
        let expected = (400.0f64 / (305.0 / 3.0)).log2();
        assert_abs_diff_eq!(fit.coefficients[[0, 1]], expected, epsilon = 1e-3);
        assert!(fit.coefficients[[1, 1]].abs() < 0.1);
        assert!(fit.standard_errors[[0, 1]] > 0.0);
        assert!(fit.coefficients[[2, 0]].is_nan());
        assert!(fit.converged[0] && fit.converged[1]);
        assert_abs_diff_eq!(
            fit.covariances[[0, 1, 1]].sqrt(),
            fit.standard_errors[[0, 1]],
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_strong_penalty_shrinks_toward_zero() {
        let (counts, norm, design, disp) = two_group_input_data();
        let wide = vec![WIDE_PRIOR_LAMBDA; 2];
        let tight = vec![WIDE_PRIOR_LAMBDA, 100.0];
        let base = RidgeFitInput {
            counts: counts.view(),
            normalization: norm.view(),
            design: design.view(),
            dispersions: disp.view(),
            weights: None,
            lambda_log2: &wide,
        };
        let shrunk_input = RidgeFitInput { lambda_log2: &tight, ..base.clone() };

        let fitter = IrlsRidgeFitter::default();
        let mle = fitter.fit(&base).unwrap();
        let shrunk = fitter.fit(&shrunk_input).unwrap();
        assert!(shrunk.coefficients[[0, 1]].abs() < mle.coefficients[[0, 1]].abs());
    }

    #[test]
    fn test_partitioned_rows_match_full_fit() {
        let (counts, norm, design, disp) = two_group_input_data();
        let lambda = vec![WIDE_PRIOR_LAMBDA, 2.0];
        let input = RidgeFitInput {
            counts: counts.view(),
            normalization: norm.view(),
            design: design.view(),
            dispersions: disp.view(),
            weights: None,
            lambda_log2: &lambda,
        };
        let fitter = IrlsRidgeFitter::default();
        let full = fitter.fit(&input).unwrap();
        let parts = vec![fitter.fit(&input.rows(0..2)).unwrap(), fitter.fit(&input.rows(2..3)).unwrap()];
        let merged = RidgeFit::concat(parts).unwrap();

        assert_eq!(merged.n_genes(), 3);
        for i in 0..2 {
            for j in 0..2 {
                assert_abs_diff_eq!(merged.coefficients[[i, j]], full.coefficients[[i, j]], epsilon = 1e-12);
                assert_abs_diff_eq!(merged.standard_errors[[i, j]], full.standard_errors[[i, j]], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_zero_weight_samples_are_ignored() {
        let (counts, norm, design, disp) = two_group_input_data();
        let mut weights = Array2::ones((3, 6));
        // drop the outlying treated sample of gene 0
        let mut counts_outlier = counts.clone();
        counts_outlier[[0, 5]] = 5000.0;
        weights[[0, 5]] = 0.0;
        let lambda = vec![WIDE_PRIOR_LAMBDA; 2];

        let fitter = IrlsRidgeFitter::default();
        let weighted = fitter
            .fit(&RidgeFitInput {
                counts: counts_outlier.view(),
                normalization: norm.view(),
                design: design.view(),
                dispersions: disp.view(),
                weights: Some(weights.view()),
                lambda_log2: &lambda,
            })
            .unwrap();
        let expected = (410.0f64 / (305.0 / 3.0)).log2();
        assert_abs_diff_eq!(weighted.coefficients[[0, 1]], expected, epsilon = 1e-3);
    }

    #[test]
    fn test_dimension_checks() {
        let (counts, norm, design, _) = two_group_input_data();
        let disp = array![0.1];
        let lambda = vec![WIDE_PRIOR_LAMBDA; 2];
        let input = RidgeFitInput {
            counts: counts.view(),
            normalization: norm.view(),
            design: design.view(),
            dispersions: disp.view(),
            weights: None,
            lambda_log2: &lambda,
        };
        assert!(matches!(
            IrlsRidgeFitter::default().fit(&input),
            Err(ShrinkError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_lbfgsb_quadratic_with_bounds() {
        let bounds = Bounds {
            lower: vec![-1.0, -10.0],
            upper: vec![10.0, 10.0],
        };
        let (x, converged) = lbfgsb_minimize(|p| (p[0] + 3.0).powi(2) + (p[1] - 2.0).powi(2), &[0.0, 0.0], &bounds);
        assert!(converged);
        assert_abs_diff_eq!(x[0], -1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(x[1], 2.0, epsilon = 1e-5);
    }

    #[test]
    fn test_lbfgsb_free_coordinate_near_bound() {
        // x0 approaches its upper bound without reaching it; x1 must still be optimised
        let bounds = Bounds {
            lower: vec![-10.0, -10.0],
            upper: vec![1.0, 10.0],
        };
        let f = |p: &[f64]| 100.0 * (p[0] - 0.999).powi(2) + (p[1] + 4.0).powi(2);
        let (x, converged) = lbfgsb_minimize(f, &[0.0, 0.0], &bounds);
        assert!(converged);
        assert_abs_diff_eq!(x[0], 0.999, epsilon = 1e-6);
        assert_abs_diff_eq!(x[1], -4.0, epsilon = 1e-5);
    }

    #[test]
    fn test_lbfgsb_converged_means_stationary() {
        let bounds = Bounds {
            lower: vec![-5.0, -5.0],
            upper: vec![5.0, 5.0],
        };
        let rosenbrock = |p: &[f64]| (1.0 - p[0]).powi(2) + 100.0 * (p[1] - p[0] * p[0]).powi(2);
        let (x, converged) = lbfgsb_minimize(rosenbrock, &[-1.2, 1.0], &bounds);
        let pg = bounds.projected_gradient_inf(&x, &numeric_gradient(&rosenbrock, &x));
        if converged {
            assert!(pg <= 1e-6 * (1.0 + rosenbrock(&x)), "{}", pg);
            assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-4);
            assert_abs_diff_eq!(x[1], 1.0, epsilon = 1e-4);
        } else {
            assert!(pg > 1e-6 * (1.0 + rosenbrock(&x)), "{}", pg);
        }
        assert!(rosenbrock(&x) < rosenbrock(&[-1.2, 1.0]));
    }
}
