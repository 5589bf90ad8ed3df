//! apeglm-style shrinkage (Zhu, Ibrahim, Love 2018): a Cauchy prior on the
//! shrunken coefficient, MAP estimates by L-BFGS and a Laplace approximation
//! of the posterior SD.
//!
//! R equivalent: apeglm::apeglm() with method "nbinomCR" / "nbinomC", its
//! priorVar() and the LBFGSpp optimiser behind nbinomGLM.cpp. Natural-log scale
//! throughout.

use rayon::prelude::*;
use std::collections::VecDeque;

use super::backend::{arg_f64, arg_usize, builtin_identity, BackendArgs};
use super::parametric::{
    ParametricEstimator, ParametricFit, ParametricInput, ParametricMethod, PriorControl, PriorControlInput,
};
use crate::error::{Result, ShrinkError};
use crate::glm::two_loop_direction;
use crate::stats;

/// Bounds of the method-of-moments prior variance. R: priorVar(), 0.001^2 and 20^2
const MIN_PRIOR_VAR: f64 = 1e-6;
const MAX_PRIOR_VAR: f64 = 400.0;

/// apeglm's prior.scale when the prior is not adapted from the MLE
const DEFAULT_PRIOR_SCALE: f64 = 1.0;

/// Tuning of the apeglm fit; any field can be overridden from `backend_args`
#[derive(Debug, Clone, PartialEq)]
pub struct ApeglmParams {
    /// R: multiplier
    pub multiplier: f64,
    /// Cap on the adapted prior scale
    pub max_prior_scale: f64,
    /// R: prior.no.shrink.scale
    pub no_shrink_scale: f64,
    pub lbfgs_max_iter: usize,
    pub lbfgs_epsilon: f64,
    pub lbfgs_memory: usize,
    /// Finite difference step of the Hessian. R: optimHess ndeps
    pub hessian_step: f64,
    /// Largest disagreement between the two nbinomCR starts still called converged
    pub convergence_threshold: f64,
}

impl Default for ApeglmParams {
    fn default() -> Self {
        Self {
            multiplier: 1.0,
            max_prior_scale: 1.0,
            no_shrink_scale: 15.0,
            lbfgs_max_iter: 300,
            lbfgs_epsilon: 1e-8,
            lbfgs_memory: 6,
            hessian_step: 1e-3,
            convergence_threshold: 0.01,
        }
    }
}

impl ApeglmParams {
    /// Overlay `args` on these parameters. Unrecognised keys are returned, not rejected.
    pub fn with_args(&self, args: &BackendArgs) -> Result<(Self, Vec<String>)> {
        let mut params = self.clone();
        let mut unknown = Vec::new();
        for (key, value) in args {
            match key.as_str() {
                "multiplier" => params.multiplier = arg_f64(key, value)?,
                "max_prior_scale" => params.max_prior_scale = arg_f64(key, value)?,
                "no_shrink_scale" => params.no_shrink_scale = arg_f64(key, value)?,
                "lbfgs_max_iter" => params.lbfgs_max_iter = arg_usize(key, value)?,
                "lbfgs_epsilon" => params.lbfgs_epsilon = arg_f64(key, value)?,
                "lbfgs_memory" => params.lbfgs_memory = arg_usize(key, value)?,
                "hessian_step" => params.hessian_step = arg_f64(key, value)?,
                "convergence_threshold" => params.convergence_threshold = arg_f64(key, value)?,
                _ => unknown.push(key.clone()),
            }
        }
        if params.lbfgs_memory == 0 || params.lbfgs_max_iter == 0 || params.hessian_step <= 0.0 {
            return Err(ShrinkError::InvalidInput {
                reason: "lbfgs_memory, lbfgs_max_iter and hessian_step must be positive".to_string(),
            });
        }
        Ok((params, unknown))
    }

    fn solver(&self) -> Lbfgs {
        Lbfgs {
            max_iter: self.lbfgs_max_iter,
            epsilon: self.lbfgs_epsilon,
            memory: self.lbfgs_memory,
        }
    }
}

/// Built-in parametric estimator
#[derive(Debug, Clone, Default)]
pub struct ApeglmEstimator {
    params: ApeglmParams,
}

impl ApeglmEstimator {
    pub fn new(params: ApeglmParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ApeglmParams {
        &self.params
    }
}

impl ParametricEstimator for ApeglmEstimator {
    fn identity(&self) -> String {
        builtin_identity("apeglm")
    }

    fn prior_control(&self, input: &PriorControlInput<'_>, args: &BackendArgs) -> Result<PriorControl> {
        let (params, unknown) = self.params.with_args(args)?;
        if !unknown.is_empty() {
            log::warn!("Ignoring unknown apeglm arguments: {}", unknown.join(", "));
        }
        if input.coefficient >= input.n_coefs {
            return Err(ShrinkError::InvalidCoefficient {
                reason: format!("index {} is out of range 1..={}", input.coefficient + 1, input.n_coefs),
            });
        }

        match input.mle {
            Some((lfc, se)) => {
                let prior_var = prior_var(lfc, se);
                let prior_scale = (params.multiplier * prior_var.sqrt()).min(params.max_prior_scale);
                log::debug!("apeglm prior_var={:.6}, prior_scale={:.7}, n={}", prior_var, prior_scale, lfc.len());
                Ok(PriorControl {
                    no_shrink: (0..input.n_coefs).filter(|&k| k != input.coefficient).collect(),
                    shrink: vec![input.coefficient],
                    prior_scale,
                    no_shrink_scale: params.no_shrink_scale,
                    prior_var: Some(prior_var),
                })
            }
            None => {
                // apeglm's fixed prior: only the first (intercept) column escapes shrinkage
                let anchor = input.intercept.unwrap_or(0);
                Ok(PriorControl {
                    no_shrink: vec![anchor],
                    shrink: (0..input.n_coefs).filter(|&k| k != anchor).collect(),
                    prior_scale: DEFAULT_PRIOR_SCALE,
                    no_shrink_scale: params.no_shrink_scale,
                    prior_var: None,
                })
            }
        }
    }

    fn fit(&self, input: &ParametricInput<'_>, prior: &PriorControl, args: &BackendArgs) -> Result<ParametricFit> {
        input.validate(prior)?;
        let (params, _) = self.params.with_args(args)?;
        let n_coefs = input.design.ncols();
        let design_rows: Vec<Vec<f64>> = input.design.rows().into_iter().map(|r| r.to_vec()).collect();

        let genes: Vec<GeneFit> = (0..input.n_genes())
            .into_par_iter()
            .map(|i| {
                let y = input.counts.row(i).to_vec();
                // R: all-zero rows are not fit
                if y.iter().sum::<f64>() == 0.0 {
                    return GeneFit::missing(n_coefs, None);
                }
                let dispersion = input.dispersions[i];
                if !(dispersion.is_finite() && dispersion > 0.0) {
                    return GeneFit::missing(n_coefs, Some(false));
                }
                let offsets = input.offsets.row(i).to_vec();
                let weights = input.weights.row(i).to_vec();
                let gene = GeneData {
                    y: &y,
                    x: &design_rows,
                    offsets: &offsets,
                    weights: &weights,
                    size: 1.0 / dispersion,
                    prior,
                };
                gene.fit(input.coefficient, input.method, &params)
            })
            .collect();

        let fsr: Vec<f64> = genes.iter().map(|g| g.fsr).collect();
        let mut fit = ParametricFit {
            map: Vec::with_capacity(genes.len()),
            sd: Vec::with_capacity(genes.len()),
            svalue: stats::svalue(&fsr),
            fsr,
            converged: Vec::with_capacity(genes.len()),
        };
        for g in genes {
            fit.map.push(g.map);
            fit.sd.push(g.sd);
            fit.converged.push(g.converged);
        }
        Ok(fit)
    }
}

/// Method-of-moments prior variance from MLE effects and SEs.
/// Root of `A = sum((X^2 - D) I(A)) / sum(I(A))`, `I(A) = 1 / (2 (A + D)^2)`,
/// found by bisection on [1e-6, 400]. R: apeglm:::priorVar
fn prior_var(mle_lfc: &[f64], mle_se: &[f64]) -> f64 {
    let (s, d): (Vec<f64>, Vec<f64>) = mle_lfc
        .iter()
        .zip(mle_se)
        .filter(|(x, se)| x.is_finite() && se.is_finite())
        .map(|(x, se)| (x * x, se * se))
        .unzip();
    if s.is_empty() {
        return MIN_PRIOR_VAR;
    }

    let objective = |a: f64| -> f64 {
        let (num, den) = s.iter().zip(&d).fold((0.0, 0.0), |(num, den), (sj, dj)| {
            let info = 1.0 / (2.0 * (a + dj).powi(2));
            (num + (sj - dj) * info, den + info)
        });
        let ahat = if den == 0.0 { 0.0 } else { num / den };
        ahat - a
    };

    let (mut lo, mut hi) = (MIN_PRIOR_VAR, MAX_PRIOR_VAR);
    let (f_lo, f_hi) = (objective(lo), objective(hi));
    if f_lo < 0.0 {
        return MIN_PRIOR_VAR;
    }
    if f_lo * f_hi > 0.0 {
        return if f_lo.abs() < f_hi.abs() { lo } else { hi };
    }
    for _ in 0..100 {
        let mid = 0.5 * (lo + hi);
        let f_mid = objective(mid);
        if f_mid.abs() < 1e-12 || hi - lo < 1e-12 {
            return mid;
        }
        if f_mid * f_lo < 0.0 {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    0.5 * (lo + hi)
}

#[derive(Debug, Clone)]
struct GeneFit {
    map: Vec<f64>,
    sd: Vec<f64>,
    fsr: f64,
    converged: Option<bool>,
}

impl GeneFit {
    fn missing(n_coefs: usize, converged: Option<bool>) -> Self {
        Self {
            map: vec![f64::NAN; n_coefs],
            sd: vec![f64::NAN; n_coefs],
            fsr: f64::NAN,
            converged,
        }
    }
}

/// One feature's negative binomial posterior
struct GeneData<'a> {
    y: &'a [f64],
    /// Design rows, samples x coefficients
    x: &'a [Vec<f64>],
    offsets: &'a [f64],
    weights: &'a [f64],
    /// 1 / dispersion
    size: f64,
    prior: &'a PriorControl,
}

impl GeneData<'_> {
    fn n_coefs(&self) -> usize {
        self.x.first().map_or(0, Vec::len)
    }

    /// Negative log posterior up to a constant, with its gradient when asked.
    /// R: nbinomFn / nbinomGr
    fn evaluate(&self, beta: &[f64], mut grad: Option<&mut [f64]>) -> f64 {
        if let Some(g) = grad.as_deref_mut() {
            g.iter_mut().for_each(|v| *v = 0.0);
        }

        let mut value = 0.0;
        for (j, row) in self.x.iter().enumerate() {
            let w = self.weights[j];
            let eta = dot(row, beta) + self.offsets[j];
            let mu = eta.exp();
            let a = self.y[j] + self.size;
            let b = mu + self.size;
            value -= w * (self.y[j] * eta - a * b.ln());
            if let Some(g) = grad.as_deref_mut() {
                let c = w * (self.y[j] - a * mu / b);
                for (gk, xk) in g.iter_mut().zip(row) {
                    *gk -= xk * c;
                }
            }
        }

        let wide = self.prior.no_shrink_scale.powi(2);
        let scale_sq = self.prior.prior_scale.powi(2);
        for &k in &self.prior.no_shrink {
            value += beta[k] * beta[k] / (2.0 * wide);
            if let Some(g) = grad.as_deref_mut() {
                g[k] += beta[k] / wide;
            }
        }
        for &k in &self.prior.shrink {
            let b2 = beta[k] * beta[k];
            value += (1.0 + b2 / scale_sq).ln();
            if let Some(g) = grad.as_deref_mut() {
                g[k] += 2.0 * beta[k] / (scale_sq + b2);
            }
        }
        value
    }

    /// The optimiser's objective: `f / cnst + 10`. R: nbinomGLM.cpp
    fn scaled(&self, beta: &[f64], grad: &mut [f64], cnst: f64) -> f64 {
        let value = self.evaluate(beta, Some(&mut *grad));
        grad.iter_mut().for_each(|g| *g /= cnst);
        value / cnst + 10.0
    }

    /// Hessian by central differences of the gradient, symmetrised. R: optimHess
    fn hessian(&self, beta: &[f64], step: f64) -> Vec<f64> {
        let n = beta.len();
        let mut h = vec![0.0; n * n];
        let mut x = beta.to_vec();
        let mut plus = vec![0.0; n];
        let mut minus = vec![0.0; n];
        for i in 0..n {
            x[i] = beta[i] + step;
            self.evaluate(&x, Some(&mut plus));
            x[i] = beta[i] - step;
            self.evaluate(&x, Some(&mut minus));
            x[i] = beta[i];
            for j in 0..n {
                h[i * n + j] = (plus[j] - minus[j]) / (2.0 * step);
            }
        }
        for i in 0..n {
            for j in 0..i {
                let avg = 0.5 * (h[i * n + j] + h[j * n + i]);
                h[i * n + j] = avg;
                h[j * n + i] = avg;
            }
        }
        h
    }

    fn fit(&self, coefficient: usize, method: ParametricMethod, params: &ApeglmParams) -> GeneFit {
        let n = self.n_coefs();
        // R: cnst <- nbinomFn(0, ...); ifelse(cnst > 1, cnst, 1)
        let cnst = self.evaluate(&vec![0.0; n], None).max(1.0);
        let solver = params.solver();
        let objective = |b: &[f64], g: &mut [f64]| self.scaled(b, g, cnst);

        let mut map = alternating_start(n, 0.1);
        let first = solver.minimize(objective, &mut map);
        let converged = match method {
            ParametricMethod::NbinomC => first.converged,
            ParametricMethod::NbinomCR => {
                let mut other = alternating_start(n, -0.1);
                let second = solver.minimize(objective, &mut other);
                let agree = starts_agree(&first, &map, &second, &other, params.convergence_threshold);
                if !agree && second.value < first.value {
                    map = other;
                }
                agree
            }
        };

        let mut sd = laplace_sd(&self.hessian(&map, params.hessian_step), n);
        if sd.is_none() && converged {
            // Polish with a tighter tolerance before giving up on the Laplace SD
            let tighter = Lbfgs {
                max_iter: solver.max_iter * 2,
                epsilon: solver.epsilon * 0.1,
                memory: solver.memory,
            };
            let mut polished = map.clone();
            tighter.minimize(objective, &mut polished);
            sd = laplace_sd(&self.hessian(&polished, params.hessian_step), n);
        }
        let sd = sd.unwrap_or_else(|| vec![f64::NAN; n]);

        GeneFit {
            fsr: stats::normal_lower_tail(-map[coefficient].abs(), sd[coefficient]),
            map,
            sd,
            converged: Some(converged),
        }
    }
}

/// R: rep(c(start, -start), length = n)
fn alternating_start(n: usize, start: f64) -> Vec<f64> {
    (0..n).map(|k| if k % 2 == 0 { start } else { -start }).collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Posterior SDs from the Hessian of the negative log posterior:
/// square roots of the diagonal of its inverse, None unless it is positive definite.
fn laplace_sd(hessian: &[f64], n: usize) -> Option<Vec<f64>> {
    // Cholesky, H = L L'
    let mut l = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..=i {
            let sum = hessian[i * n + j] - (0..j).map(|k| l[i * n + k] * l[j * n + k]).sum::<f64>();
            if i == j {
                if !(sum > 0.0 && sum.is_finite()) {
                    return None;
                }
                l[i * n + i] = sum.sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }

    // diag(H^-1)_i = || L^-1 e_i ||^2
    let mut sd = Vec::with_capacity(n);
    for i in 0..n {
        let mut z = vec![0.0; n];
        for r in i..n {
            let rhs = if r == i { 1.0 } else { 0.0 };
            let sum: f64 = (i..r).map(|k| l[r * n + k] * z[k]).sum();
            z[r] = (rhs - sum) / l[r * n + r];
        }
        let var: f64 = z.iter().map(|v| v * v).sum();
        sd.push(var.sqrt());
    }
    Some(sd)
}

/// nbinomCR convergence: both starts converged and land within `threshold`
/// of each other in every coordinate
fn starts_agree(first: &Minimum, first_x: &[f64], second: &Minimum, second_x: &[f64], threshold: f64) -> bool {
    let delta = first_x
        .iter()
        .zip(second_x)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f64::max);
    first.converged && second.converged && delta <= threshold
}

/// L-BFGS with a backtracking strong-Wolfe line search and LBFGSpp's
/// stopping rules (gradient norm, one-step relative decrease).
#[derive(Debug, Clone, Copy)]
struct Lbfgs {
    max_iter: usize,
    epsilon: f64,
    memory: usize,
}

#[derive(Debug, Clone, Copy)]
struct Minimum {
    value: f64,
    converged: bool,
}

impl Lbfgs {
    const FTOL: f64 = 1e-4;
    const WOLFE: f64 = 0.9;
    const STEP_DEC: f64 = 0.5;
    const STEP_INC: f64 = 2.1;
    const MAX_LINESEARCH: usize = 100;

    fn norm(v: &[f64]) -> f64 {
        dot(v, v).sqrt()
    }

    fn small_gradient(&self, grad: &[f64], x: &[f64]) -> bool {
        let gnorm = Self::norm(grad);
        gnorm <= self.epsilon || gnorm <= self.epsilon * Self::norm(x)
    }

    /// Minimise `f_grad` in place from the starting point in `x`
    fn minimize<F>(&self, f_grad: F, x: &mut [f64]) -> Minimum
    where
        F: Fn(&[f64], &mut [f64]) -> f64,
    {
        let n = x.len();
        let mut grad = vec![0.0; n];
        let mut fx = f_grad(x, &mut grad);
        if self.small_gradient(&grad, x) {
            return Minimum { value: fx, converged: true };
        }

        let mut history: VecDeque<(Vec<f64>, Vec<f64>, f64)> = VecDeque::with_capacity(self.memory);
        let mut direction: Vec<f64> = grad.iter().map(|g| -g).collect();
        let mut step = 1.0 / Self::norm(&direction);
        let mut x_prev = vec![0.0; n];
        let mut grad_prev = vec![0.0; n];

        for iter in 1.. {
            x_prev.copy_from_slice(x);
            grad_prev.copy_from_slice(&grad);
            let f_prev = fx;
            let dg_init = dot(&grad, &direction);

            let mut accepted = false;
            for _ in 0..Self::MAX_LINESEARCH {
                for i in 0..n {
                    x[i] = x_prev[i] + step * direction[i];
                }
                fx = f_grad(x, &mut grad);
                let width = if fx.is_nan() || fx > f_prev + step * Self::FTOL * dg_init {
                    Self::STEP_DEC
                } else {
                    let dg = dot(&grad, &direction);
                    if dg < Self::WOLFE * dg_init {
                        Self::STEP_INC
                    } else if dg > -Self::WOLFE * dg_init {
                        Self::STEP_DEC
                    } else {
                        accepted = true;
                        break;
                    }
                };
                step *= width;
            }
            if !accepted {
                return Minimum { value: fx, converged: false };
            }

            if self.small_gradient(&grad, x) {
                return Minimum { value: fx, converged: true };
            }
            if (f_prev - fx).abs() <= self.epsilon * fx.abs().max(f_prev.abs()).max(1.0) {
                return Minimum { value: fx, converged: true };
            }
            if iter >= self.max_iter {
                return Minimum { value: fx, converged: false };
            }

            let s: Vec<f64> = x.iter().zip(&x_prev).map(|(a, b)| a - b).collect();
            let y: Vec<f64> = grad.iter().zip(&grad_prev).map(|(a, b)| a - b).collect();
            let sy = dot(&s, &y);
            if sy > f64::EPSILON * dot(&y, &y) {
                if history.len() == self.memory {
                    history.pop_front();
                }
                history.push_back((s, y, 1.0 / sy));
            }

            direction = two_loop_direction(&grad, &history).iter().map(|v| -v).collect();
            step = 1.0;
        }
        Minimum { value: fx, converged: false }
    }
}
