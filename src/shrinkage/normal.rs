//! Normal prior shrinkage (DESeq2 type="normal")
//!
//! 1. Estimate a prior variance per coefficient from the MLE betas
//! 2. Re-fit the GLM with ridge penalty `lambda = 1 / priorVar`
//! 3. Coefficient: read the MAP column. Contrast: regenerate results from the
//!    refit model so that `c'beta` and `sqrt(c'Sigma c)` use MAP values.
//!
//! For a coefficient the statistic and p-value columns stay those of the
//! unshrunken test; a contrast takes the whole regenerated row.
//!
//! Level contrasts on a formula design are refit on the expanded model matrix,
//! as DESeq2 does, so that every level gets the same shrinkage.

use ndarray::Array2;
use serde::Serialize;

use super::assemble::PriorDiagnostics;
use super::backend::{
    builtin_identity, BackendOutput, ConvergenceWarning, EstimatorType, RawFit, ShrinkContext, ShrinkageBackend,
};
use super::coefficient::{resolve_contrast, Contrast, ShrinkTarget};
use super::partition::Execution;
use super::prior::{tag_mle_columns, PriorVariance, PriorVarianceInput, WIDE_PRIOR_VARIANCE};
use super::refit::refit_with_prior;
use crate::data::{CoefficientFit, DesignSpec, FitKind, FittedModel};
use crate::error::{Result, ShrinkError};
use crate::glm::{build_design_matrix, DesignInfo, ModelMatrixType};
use crate::io::{ColumnKind, ResultsTable};

/// The ridge refit, log2 scale
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalFit {
    pub coefficient_names: Vec<String>,
    pub prior_variance: Vec<f64>,
    /// One row per feature
    pub coefficients: Vec<Vec<f64>>,
    pub standard_errors: Vec<Vec<f64>>,
    pub converged: Vec<bool>,
}

pub struct NormalBackend;

impl NormalBackend {
    fn incompatible(reason: &str) -> ShrinkError {
        ShrinkError::IncompatibleModelState {
            reason: format!("type='normal' {}", reason),
        }
    }

    /// Design of the refit: expanded for level contrasts on a standard formula design
    fn refit_design(model: &FittedModel, target: &ShrinkTarget) -> Result<(Array2<f64>, DesignInfo)> {
        let levels = matches!(
            target,
            ShrinkTarget::Contrast(c) if matches!(c.contrast, Contrast::Levels { .. })
        );
        match model.design() {
            DesignSpec::Formula(formula) if levels && model.model_matrix_type() == ModelMatrixType::Standard => {
                let metadata = model
                    .metadata()
                    .ok_or_else(|| Self::incompatible("needs sample metadata to expand a formula design"))?;
                log::debug!("Using the expanded model matrix for a level contrast");
                build_design_matrix(metadata, formula, ModelMatrixType::Expanded)
            }
            _ => Ok((model.design_matrix().clone(), model.design_info().clone())),
        }
    }

    /// Headline prior variance: the coefficient's, or the mean over the
    /// non-intercept columns a contrast touches
    fn scalar_prior(prior: &PriorVariance, info: &DesignInfo, target: &ShrinkTarget) -> Result<f64> {
        match target {
            ShrinkTarget::Coefficient(c) => Ok(prior.variances[c.index]),
            ShrinkTarget::Contrast(c) => {
                let weights = resolve_contrast(info, &c.contrast)?.weights;
                let used: Vec<f64> = weights
                    .iter()
                    .enumerate()
                    .filter(|&(j, w)| *w != 0.0 && !info.is_intercept(j))
                    .map(|(j, _)| prior.variances[j])
                    .collect();
                if used.is_empty() {
                    Ok(WIDE_PRIOR_VARIANCE)
                } else {
                    Ok(used.iter().sum::<f64>() / used.len() as f64)
                }
            }
            ShrinkTarget::Results => Err(Self::missing_target()),
        }
    }

    fn missing_target() -> ShrinkError {
        ShrinkError::MissingSpec {
            reason: "type='normal' requires a coefficient or a contrast".to_string(),
        }
    }
}

impl ShrinkageBackend for NormalBackend {
    fn estimator_type(&self) -> EstimatorType {
        EstimatorType::Normal
    }

    fn validate(&self, ctx: &ShrinkContext<'_>) -> Result<()> {
        let model = ctx.model;
        if matches!(ctx.target, ShrinkTarget::Results) {
            return Err(Self::missing_target());
        }
        if ctx.options.use_svalues {
            return Err(ShrinkError::InvalidInput {
                reason: "s-values are only available for type='apeglm' and type='ashr'".to_string(),
            });
        }
        if model.dispersions().is_none() {
            return Err(Self::incompatible("requires dispersions"));
        }
        if model.fit().is_none() {
            return Err(Self::incompatible("requires a fitted MLE"));
        }
        if model.has_interactions() {
            return Err(Self::incompatible(
                "is not implemented for designs with interactions; use type='apeglm' or type='ashr'",
            ));
        }
        Ok(())
    }

    fn shrink(&self, ctx: &ShrinkContext<'_>, base: &ResultsTable, execution: &Execution) -> Result<BackendOutput> {
        let model = ctx.model;
        let mle = model.fit().ok_or_else(|| Self::incompatible("requires a fitted MLE"))?;
        let dispersion_fit = model
            .dispersion_weights_source()
            .ok_or_else(|| Self::incompatible("requires dispersions"))?;
        let (design, design_info) = Self::refit_design(model, ctx.target)?;

        let columns = tag_mle_columns(&mle.columns);
        let base_means = model.base_means()?;
        let prior = ctx.services.prior_estimator().estimate(&PriorVarianceInput {
            columns: &columns,
            mle: mle.coefficients.view(),
            mle_design: model.design_info(),
            base_means: base_means.view(),
            dispersion_fit: dispersion_fit.view(),
            target_design: &design_info,
            model_matrix: model.is_user_supplied_design().then(|| model.design_matrix().view()),
            upper_quantile: ctx.options.upper_quantile,
        })?;
        if prior.variances.len() != design_info.n_coefs() {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{} prior variances", design_info.n_coefs()),
                got: format!("{}", prior.variances.len()),
            });
        }
        if let Some(v) = prior.variances.iter().find(|v| !(**v >= 0.0)) {
            return Err(ShrinkError::DegenerateModel {
                reason: format!("prior variance estimate {} is not a variance", v),
            });
        }
        log::info!(
            "Prior variance: {}",
            prior
                .coefficient_names
                .iter()
                .zip(&prior.variances)
                .map(|(n, v)| format!("{}={:.4}", n, v))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let ridge = refit_with_prior(model, &design, &design_info, &prior, ctx.services.ridge_fitter(), execution)?;

        let all_zero = model.counts().all_zero_genes();
        let failed: Vec<usize> = (0..model.n_features())
            .filter(|&i| !ridge.converged[i] && !all_zero[i])
            .collect();
        let warnings: Vec<ConvergenceWarning> =
            ConvergenceWarning::from_rows(EstimatorType::Normal, model.feature_ids(), &failed)
                .into_iter()
                .collect();

        let scalar = Self::scalar_prior(&prior, &design_info, ctx.target)?;
        let per_coefficient: Vec<(String, f64)> = prior
            .coefficient_names
            .iter()
            .cloned()
            .zip(prior.variances.iter().copied())
            .collect();
        let fit = NormalFit {
            coefficient_names: design_info.coef_names.clone(),
            prior_variance: prior.variances.clone(),
            coefficients: ridge.coefficients.rows().into_iter().map(|r| r.to_vec()).collect(),
            standard_errors: ridge.standard_errors.rows().into_iter().map(|r| r.to_vec()).collect(),
            converged: ridge.converged.clone(),
        };

        let (effect_size, standard_error, regenerated) = match ctx.target {
            ShrinkTarget::Coefficient(c) => {
                // All-zero rows keep the base values (0 / 0)
                let base_effect = base.require(ColumnKind::EffectSize)?;
                let base_se = base.require(ColumnKind::StandardError)?;
                let pick = |values: &Array2<f64>, fallback: &[f64]| -> Vec<f64> {
                    (0..model.n_features())
                        .map(|i| if all_zero[i] { fallback[i] } else { values[[i, c.index]] })
                        .collect()
                };
                (
                    pick(&ridge.coefficients, base_effect),
                    pick(&ridge.standard_errors, base_se),
                    None,
                )
            }
            ShrinkTarget::Contrast(c) => {
                let map = CoefficientFit::new(
                    FitKind::Map,
                    ridge.coefficients,
                    ridge.standard_errors,
                    Some(ridge.covariances),
                    ridge.converged,
                    &design_info,
                )?;
                let derived = model.with_fit(design, design_info, map)?;
                let resolved = resolve_contrast(derived.design_info(), &c.contrast)?;
                let table = ctx
                    .services
                    .results_provider()
                    .results(&derived, &ShrinkTarget::Contrast(resolved))?;
                table.ensure_same_rows(model)?;
                (
                    table.require(ColumnKind::EffectSize)?.to_vec(),
                    table.require(ColumnKind::StandardError)?.to_vec(),
                    Some(table),
                )
            }
            ShrinkTarget::Results => return Err(Self::missing_target()),
        };

        Ok(BackendOutput {
            effect_size,
            standard_error,
            svalue: None,
            regenerated,
            estimator: builtin_identity("normal"),
            diagnostics: PriorDiagnostics::Normal {
                prior_variance: scalar,
                per_coefficient,
            },
            fit: RawFit::Normal(fit),
            warnings,
        })
    }
}
