//! Ridge refit with the estimated prior, serial or partitioned
//! R equivalent: the fitNbinomGLMs(lambda=...) call inside lfcShrink(type="normal")

use ndarray::Array2;

use super::partition::Execution;
use super::prior::PriorVariance;
use crate::data::FittedModel;
use crate::error::{Result, ShrinkError};
use crate::glm::{DesignInfo, RidgeFit, RidgeFitInput, RidgeFitter, WIDE_PRIOR_LAMBDA};

/// Refit every feature of `model` on `design` with lambda = 1 / prior variance.
/// The output has the model's row count and order; the model is not touched.
pub fn refit_with_prior(
    model: &FittedModel,
    design: &Array2<f64>,
    design_info: &DesignInfo,
    prior: &PriorVariance,
    fitter: &dyn RidgeFitter,
    execution: &Execution,
) -> Result<RidgeFit> {
    let dispersions = model.dispersions().ok_or_else(|| ShrinkError::IncompatibleModelState {
        reason: "dispersions are required for the ridge refit".to_string(),
    })?;
    if prior.variances.len() != design.ncols() {
        return Err(ShrinkError::DimensionMismatch {
            expected: format!("{} prior variances", design.ncols()),
            got: format!("{}", prior.variances.len()),
        });
    }

    let lambda = prior.lambda_log2(design_info, WIDE_PRIOR_LAMBDA);
    log::debug!(
        "lambda (log2): {}",
        lambda
            .iter()
            .zip(design_info.coef_names.iter())
            .map(|(l, n)| format!("{}={:.6e}", n, l))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let normalization = model.normalization_matrix()?;
    let input = RidgeFitInput {
        counts: model.count_view(),
        normalization: normalization.view(),
        design: design.view(),
        dispersions: dispersions.view(),
        weights: model.weights().map(|w| w.view()),
        lambda_log2: &lambda,
    };

    log::info!("Re-fitting GLM with ridge penalty for {} features", model.n_features());
    let fit = match execution.plan(model.n_features())? {
        None => fitter.fit(&input)?,
        Some((pool, plan)) => {
            let parts = pool.run_partitions(&plan, |range| fitter.fit(&input.rows(range)))?;
            RidgeFit::concat(parts)?
        }
    };

    if fit.n_genes() != model.n_features() {
        return Err(ShrinkError::DimensionMismatch {
            expected: format!("{} refit rows", model.n_features()),
            got: format!("{}", fit.n_genes()),
        });
    }
    Ok(fit)
}
