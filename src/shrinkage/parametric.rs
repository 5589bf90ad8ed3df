//! External-parametric backend: a heavy-tailed prior fit per feature.
//! R equivalent: lfcShrink(type = "apeglm")

use ndarray::{s, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::f64::consts::{LN_2, LOG2_E};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use super::assemble::PriorDiagnostics;
use super::backend::{
    BackendArgs, BackendOutput, ConvergenceWarning, EstimatorType, RawFit, ShrinkContext, ShrinkageBackend,
};
use super::coefficient::{ResolvedCoefficient, ShrinkTarget};
use super::partition::Execution;
use crate::error::{Result, ShrinkError};
use crate::io::{ColumnKind, ResultsTable};
use crate::stats;

/// Optimisation scheme of the parametric estimator.
/// R equivalent: apeMethod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ParametricMethod {
    /// Two starts, converged only when both agree
    #[default]
    #[serde(rename = "nbinomCR")]
    NbinomCR,
    /// A single start
    #[serde(rename = "nbinomC")]
    NbinomC,
}

impl ParametricMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParametricMethod::NbinomCR => "nbinomCR",
            ParametricMethod::NbinomC => "nbinomC",
        }
    }

    /// None selects the default
    pub fn from_option(method: Option<&str>) -> Result<Self> {
        method.map_or(Ok(Self::default()), str::parse)
    }
}

impl fmt::Display for ParametricMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParametricMethod {
    type Err = ShrinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nbinomCR" => Ok(ParametricMethod::NbinomCR),
            "nbinomC" => Ok(ParametricMethod::NbinomC),
            other => Err(ShrinkError::InvalidInput {
                reason: format!("Unknown method '{}'. Use 'nbinomCR' or 'nbinomC'.", other),
            }),
        }
    }
}

/// Prior on the coefficients, natural-log scale.
/// R equivalent: apeglm's prior.control list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorControl {
    /// Coefficients with a wide normal prior
    pub no_shrink: Vec<usize>,
    /// Coefficients with the Cauchy prior
    pub shrink: Vec<usize>,
    pub prior_scale: f64,
    pub no_shrink_scale: f64,
    /// Method-of-moments estimate, when the prior was adapted from the MLE
    pub prior_var: Option<f64>,
}

impl PriorControl {
    fn validate(&self, n_coefs: usize) -> Result<()> {
        if let Some(&k) = self.no_shrink.iter().chain(&self.shrink).find(|&&k| k >= n_coefs) {
            return Err(ShrinkError::InvalidInput {
                reason: format!("prior control refers to coefficient {} of {}", k, n_coefs),
            });
        }
        if !(self.prior_scale > 0.0 && self.no_shrink_scale > 0.0) {
            return Err(ShrinkError::InvalidInput {
                reason: "prior scales must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// What the prior is estimated from
#[derive(Debug, Clone, Copy)]
pub struct PriorControlInput<'a> {
    pub n_coefs: usize,
    /// 0-based coefficient being shrunk
    pub coefficient: usize,
    pub intercept: Option<usize>,
    /// MLE effect and SE on the natural-log scale, features with counts only
    pub mle: Option<(&'a [f64], &'a [f64])>,
}

/// Per-feature data for the parametric fit
#[derive(Debug, Clone)]
pub struct ParametricInput<'a> {
    /// genes x samples
    pub counts: ArrayView2<'a, f64>,
    /// samples x coefficients
    pub design: ArrayView2<'a, f64>,
    /// genes x samples, natural log
    pub offsets: ArrayView2<'a, f64>,
    /// genes x samples
    pub weights: ArrayView2<'a, f64>,
    pub dispersions: ArrayView1<'a, f64>,
    /// 0-based coefficient whose false sign rate is reported
    pub coefficient: usize,
    pub method: ParametricMethod,
}

impl<'a> ParametricInput<'a> {
    pub fn n_genes(&self) -> usize {
        self.counts.nrows()
    }

    pub fn rows(&self, range: Range<usize>) -> ParametricInput<'a> {
        ParametricInput {
            counts: self.counts.slice_move(s![range.clone(), ..]),
            design: self.design,
            offsets: self.offsets.slice_move(s![range.clone(), ..]),
            weights: self.weights.slice_move(s![range.clone(), ..]),
            dispersions: self.dispersions.slice_move(s![range]),
            coefficient: self.coefficient,
            method: self.method,
        }
    }

    pub fn validate(&self, prior: &PriorControl) -> Result<()> {
        let (n_genes, n_samples) = self.counts.dim();
        for (what, dim) in [("offsets", self.offsets.dim()), ("weights", self.weights.dim())] {
            if dim != (n_genes, n_samples) {
                return Err(ShrinkError::DimensionMismatch {
                    expected: format!("{}x{} {}", n_genes, n_samples, what),
                    got: format!("{:?}", dim),
                });
            }
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
        if self.coefficient >= self.design.ncols() {
            return Err(ShrinkError::InvalidCoefficient {
                reason: format!("index {} is out of range for {} columns", self.coefficient + 1, self.design.ncols()),
            });
        }
        prior.validate(self.design.ncols())
    }
}

/// Posterior summaries per feature, natural-log scale
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParametricFit {
    /// Posterior mode, one row per feature
    pub map: Vec<Vec<f64>>,
    /// Laplace posterior SD, one row per feature
    pub sd: Vec<Vec<f64>>,
    /// False sign rate of the target coefficient
    pub fsr: Vec<f64>,
    pub svalue: Vec<f64>,
    /// None where no fit was attempted
    pub converged: Vec<Option<bool>>,
}

impl ParametricFit {
    pub fn n_rows(&self) -> usize {
        self.map.len()
    }

    /// Join fits of consecutive row blocks; s-values are recomputed over the
    /// merged false sign rates since they depend on every row.
    pub fn concat(parts: Vec<ParametricFit>) -> ParametricFit {
        let mut merged = ParametricFit {
            map: Vec::new(),
            sd: Vec::new(),
            fsr: Vec::new(),
            svalue: Vec::new(),
            converged: Vec::new(),
        };
        for part in parts {
            merged.map.extend(part.map);
            merged.sd.extend(part.sd);
            merged.fsr.extend(part.fsr);
            merged.converged.extend(part.converged);
        }
        merged.svalue = stats::svalue(&merged.fsr);
        merged
    }

    /// Rows with a fit that did not converge
    pub fn not_converged(&self) -> Vec<usize> {
        self.converged
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == Some(false))
            .map(|(i, _)| i)
            .collect()
    }

    fn column(rows: &[Vec<f64>], j: usize, scale: f64) -> Vec<f64> {
        rows.iter().map(|r| r.get(j).map_or(f64::NAN, |v| v * scale)).collect()
    }
}

/// A per-feature parametric shrinkage estimator.
/// R equivalent: the apeglm package
pub trait ParametricEstimator: Send + Sync {
    /// Name and version, reported in the prior info
    fn identity(&self) -> String;

    /// Estimate the prior once over the full feature set
    fn prior_control(&self, input: &PriorControlInput<'_>, args: &BackendArgs) -> Result<PriorControl>;

    /// Fit every row of `input` under a fixed prior
    fn fit(&self, input: &ParametricInput<'_>, prior: &PriorControl, args: &BackendArgs) -> Result<ParametricFit>;
}

fn target_coefficient(target: &ShrinkTarget) -> Result<&ResolvedCoefficient> {
    match target {
        ShrinkTarget::Coefficient(c) => Ok(c),
        ShrinkTarget::Contrast(c) => Err(ShrinkError::UnsupportedContrast {
            reason: format!(
                "'{}': type='apeglm' shrinks a single coefficient; use coef, or type='normal' or 'ashr' for contrasts",
                c.label
            ),
        }),
        ShrinkTarget::Results => Err(ShrinkError::MissingSpec {
            reason: "type='apeglm' requires a coefficient".to_string(),
        }),
    }
}

pub struct ParametricBackend;

impl ShrinkageBackend for ParametricBackend {
    fn estimator_type(&self) -> EstimatorType {
        EstimatorType::ExternalParametric
    }

    fn validate(&self, ctx: &ShrinkContext<'_>) -> Result<()> {
        target_coefficient(ctx.target)?;
        if ctx.model.dispersions().is_none() {
            return Err(ShrinkError::IncompatibleModelState {
                reason: "type='apeglm' requires dispersions".to_string(),
            });
        }
        ParametricMethod::from_option(ctx.options.backend_method.as_deref())?;
        ctx.services.parametric()?;
        Ok(())
    }

    fn shrink(&self, ctx: &ShrinkContext<'_>, base: &ResultsTable, execution: &Execution) -> Result<BackendOutput> {
        let model = ctx.model;
        let options = ctx.options;
        let coefficient = target_coefficient(ctx.target)?;
        let method = ParametricMethod::from_option(options.backend_method.as_deref())?;
        let estimator = ctx.services.parametric()?;
        let dispersions = model.dispersions().ok_or_else(|| ShrinkError::IncompatibleModelState {
            reason: "type='apeglm' requires dispersions".to_string(),
        })?;

        let counts = model.count_view();
        let n_genes = model.n_features();
        let nonzero: Vec<bool> = counts.rows().into_iter().map(|r| r.sum() > 0.0).collect();

        // apeglm works on the natural-log scale
        let mle = if options.adapt_prior_from_mle {
            let effect = base.require(ColumnKind::EffectSize)?;
            let se = base.require(ColumnKind::StandardError)?;
            let rows: Vec<usize> = (0..n_genes).filter(|&i| nonzero[i]).collect();
            Some(natural_log_scale(effect, se, &rows))
        } else {
            None
        };
        let prior = estimator.prior_control(
            &PriorControlInput {
                n_coefs: model.design_info().n_coefs(),
                coefficient: coefficient.index,
                intercept: model.design_info().intercept,
                mle: mle.as_ref().map(|(l, s)| (l.as_slice(), s.as_slice())),
            },
            &options.backend_args,
        )?;
        log::info!(
            "apeglm prior: scale {:.6}, shrinking {:?}, method {}",
            prior.prior_scale,
            prior.shrink,
            method
        );

        let offsets = model.offset_matrix()?;
        let weights = model.weights_matrix();
        let input = ParametricInput {
            counts,
            design: model.design_matrix().view(),
            offsets: offsets.view(),
            weights: weights.view(),
            dispersions: dispersions.view(),
            coefficient: coefficient.index,
            method,
        };

        let fit = match execution.plan(n_genes)? {
            None => estimator.fit(&input, &prior, &options.backend_args)?,
            Some((pool, plan)) => ParametricFit::concat(
                pool.run_partitions(&plan, |range| estimator.fit(&input.rows(range), &prior, &options.backend_args))?,
            ),
        };
        if fit.n_rows() != n_genes {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{} parametric fit rows", n_genes),
                got: format!("{}", fit.n_rows()),
            });
        }

        let not_converged = fit.not_converged();
        let warnings = ConvergenceWarning::from_rows(self.estimator_type(), model.feature_ids(), &not_converged)
            .into_iter()
            .collect();

        Ok(BackendOutput {
            effect_size: ParametricFit::column(&fit.map, coefficient.index, LOG2_E),
            standard_error: ParametricFit::column(&fit.sd, coefficient.index, LOG2_E),
            svalue: options.use_svalues.then(|| fit.svalue.clone()),
            regenerated: None,
            estimator: estimator.identity(),
            diagnostics: PriorDiagnostics::Parametric {
                prior_control: prior,
                method,
                not_converged: not_converged.len(),
            },
            fit: RawFit::Parametric(fit),
            warnings,
        })
    }
}

/// Effect and SE of `rows`, log2 to natural log
fn natural_log_scale(effect: &[f64], se: &[f64], rows: &[usize]) -> (Vec<f64>, Vec<f64>) {
    rows.iter().map(|&i| (effect[i] * LN_2, se[i] * LN_2)).unzip()
}
