//! External-nonparametric backend: a mixture prior fit jointly over all features.
//! R equivalent: lfcShrink(type = "ashr")

use serde::{Deserialize, Serialize};

use super::assemble::PriorDiagnostics;
use super::backend::{
    BackendArgs, BackendOutput, ConvergenceWarning, EstimatorType, RawFit, ShrinkContext, ShrinkageBackend,
};
use super::partition::Execution;
use crate::error::{Result, ShrinkError};
use crate::io::{ColumnKind, ResultsTable};

/// Fitted mixture: zero-centred normal components and their weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixtureSummary {
    /// Component standard deviations, 0 for the point mass
    pub sd: Vec<f64>,
    pub pi: Vec<f64>,
}

/// Posterior summaries per feature, on the scale of the input effects
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NonparametricFit {
    pub posterior_mean: Vec<f64>,
    pub posterior_sd: Vec<f64>,
    /// Local false sign rate
    pub lfsr: Vec<f64>,
    pub svalue: Vec<f64>,
    pub mixture: MixtureSummary,
    pub log_likelihood: f64,
    pub converged: bool,
}

/// A joint (all-feature) shrinkage estimator.
/// R equivalent: ashr::ash(betahat, sebetahat)
pub trait NonparametricEstimator: Send + Sync {
    fn identity(&self) -> String;

    /// Rows with a non-finite effect or a non-positive SE come back as NaN
    fn fit(&self, betahat: &[f64], sebetahat: &[f64], args: &BackendArgs) -> Result<NonparametricFit>;
}

pub struct NonparametricBackend;

impl ShrinkageBackend for NonparametricBackend {
    fn estimator_type(&self) -> EstimatorType {
        EstimatorType::ExternalNonparametric
    }

    fn validate(&self, ctx: &ShrinkContext<'_>) -> Result<()> {
        ctx.services.nonparametric()?;
        Ok(())
    }

    fn shrink(&self, ctx: &ShrinkContext<'_>, base: &ResultsTable, execution: &Execution) -> Result<BackendOutput> {
        if execution.is_parallel() {
            log::info!("type='ashr' fits all features jointly; running serially");
        }
        let estimator = ctx.services.nonparametric()?;
        let betahat = base.require(ColumnKind::EffectSize)?;
        let sebetahat = base.require(ColumnKind::StandardError)?;

        log::info!("Fitting mixture prior to {} features", betahat.len());
        let fit = estimator.fit(betahat, sebetahat, &ctx.options.backend_args)?;
        if fit.posterior_mean.len() != betahat.len() || fit.posterior_sd.len() != betahat.len() {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{} posterior rows", betahat.len()),
                got: format!("{}", fit.posterior_mean.len()),
            });
        }
        // The EM is joint, so every fitted row carries its non-convergence
        let warnings: Vec<ConvergenceWarning> = if fit.converged {
            Vec::new()
        } else {
            log::debug!("Mixture EM did not converge; posterior summaries use the last iterate");
            let fitted: Vec<usize> = (0..betahat.len())
                .filter(|&i| fit.posterior_mean[i].is_finite())
                .collect();
            ConvergenceWarning::from_rows(self.estimator_type(), base.feature_ids(), &fitted)
                .into_iter()
                .collect()
        };

        Ok(BackendOutput {
            effect_size: fit.posterior_mean.clone(),
            standard_error: fit.posterior_sd.clone(),
            svalue: ctx.options.use_svalues.then(|| fit.svalue.clone()),
            regenerated: None,
            estimator: estimator.identity(),
            diagnostics: PriorDiagnostics::Nonparametric {
                mixture: fit.mixture.clone(),
                log_likelihood: fit.log_likelihood,
            },
            fit: RawFit::Nonparametric(fit),
            warnings,
        })
    }
}
