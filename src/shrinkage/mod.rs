//! Log fold change shrinkage
//! R equivalent: lfcShrink() in lfcShrink.R
//!
//! Three estimators behind one call:
//! - `normal`: empirical normal prior, ridge refit of the GLM
//! - `apeglm`: heavy-tailed (Cauchy) prior, per-feature MAP and Laplace SD
//! - `ashr`: zero-centred normal mixture prior fit jointly by EM
//!
//! [`lfc_shrink`] resolves what is shrunk, checks the model, obtains the
//! unshrunken results, dispatches to the backend and assembles a new table.

mod apeglm;
mod ashr;
mod assemble;
mod backend;
mod coefficient;
mod nonparametric;
mod normal;
mod parametric;
mod partition;
mod prior;
mod refit;

pub use apeglm::{ApeglmEstimator, ApeglmParams};
pub use ashr::{AshEstimator, AshrParams};
pub use assemble::{assemble, PriorDiagnostics, PriorInfo, ShrinkOutput};
pub use backend::{
    backend_for, BackendArgs, BackendOutput, ConvergenceWarning, EstimatorType, RawFit, ShrinkContext,
    ShrinkServices, ShrinkageBackend,
};
pub use coefficient::{
    resolve_coefficient, resolve_contrast, resolve_target, CoefficientRef, Contrast, ResolvedCoefficient,
    ResolvedContrast, ShrinkTarget,
};
pub use nonparametric::{MixtureSummary, NonparametricBackend, NonparametricEstimator, NonparametricFit};
pub use normal::{NormalBackend, NormalFit};
pub use parametric::{
    ParametricBackend, ParametricEstimator, ParametricFit, ParametricInput, ParametricMethod, PriorControl,
    PriorControlInput,
};
pub use partition::{Execution, PartitionPlan, WorkerPool};
pub use prior::{
    tag_mle_columns, PriorVariance, PriorVarianceEstimator, PriorVarianceInput, UpperQuantilePriorVariance,
    MLE_PREFIX, WIDE_PRIOR_VARIANCE,
};
pub use refit::refit_with_prior;

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use crate::data::FittedModel;
use crate::error::{Result, ShrinkError};
use crate::io::ResultsTable;

/// Options of a shrinkage call.
/// R equivalent: the arguments of lfcShrink()
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShrinkOptions {
    /// R: coef
    pub coefficient: Option<CoefficientRef>,
    pub contrast: Option<Contrast>,
    /// R: type
    pub estimator: EstimatorType,
    /// R: svalue
    pub use_svalues: bool,
    /// R: returnList
    pub return_fit_detail: bool,
    /// R: apeAdapt
    pub adapt_prior_from_mle: bool,
    /// R: apeMethod
    pub backend_method: Option<String>,
    pub parallel: bool,
    /// Partitions per worker
    pub chunk_multiplier: usize,
    /// Upper quantile matched by the normal prior
    pub upper_quantile: f64,
    /// Passed through to the apeglm / ashr estimator
    pub backend_args: BackendArgs,
}

impl Default for ShrinkOptions {
    fn default() -> Self {
        Self {
            coefficient: None,
            contrast: None,
            estimator: EstimatorType::Normal,
            use_svalues: false,
            return_fit_detail: false,
            adapt_prior_from_mle: true,
            backend_method: None,
            parallel: false,
            chunk_multiplier: 1,
            upper_quantile: crate::stats::DEFAULT_UPPER_QUANTILE,
            backend_args: BackendArgs::new(),
        }
    }
}

impl ShrinkOptions {
    fn validate(&self) -> Result<()> {
        if self.chunk_multiplier == 0 {
            return Err(ShrinkError::InvalidInput {
                reason: "chunk multiplier must be at least 1".to_string(),
            });
        }
        if !(self.upper_quantile > 0.0 && self.upper_quantile < 1.0) {
            return Err(ShrinkError::InvalidInput {
                reason: format!("upper quantile must be in (0, 1), got {}", self.upper_quantile),
            });
        }
        Ok(())
    }
}

fn execution_for(estimator: EstimatorType, options: &ShrinkOptions, services: &ShrinkServices) -> Result<Execution> {
    if !options.parallel {
        return Ok(Execution::Serial);
    }
    let pool = services.pool().ok_or_else(|| ShrinkError::InvalidInput {
        reason: "parallel execution needs a worker pool in the services".to_string(),
    })?;
    if !estimator.supports_partitioning() {
        log::info!("type='{}' is fit jointly over all features; ignoring parallel", estimator);
        return Ok(Execution::Serial);
    }
    log::debug!(
        "Running with {} workers, chunk multiplier {}",
        pool.workers(),
        options.chunk_multiplier
    );
    Ok(Execution::Parallel {
        pool: pool.clone(),
        chunk_multiplier: options.chunk_multiplier,
    })
}

/// Shrink the log2 fold changes of one coefficient or contrast.
/// R equivalent: lfcShrink(dds, coef, contrast, res, type, ...)
///
/// `results`, when given, is the caller's unshrunken table and must list the
/// model's features in the same order. Neither the model nor the table is
/// modified; the returned table is new and carries a [`PriorInfo`].
pub fn lfc_shrink(
    model: &FittedModel,
    results: Option<&ResultsTable>,
    options: &ShrinkOptions,
    services: &ShrinkServices,
) -> Result<ShrinkOutput> {
    options.validate()?;
    let target = resolve_target(
        model,
        options.coefficient.as_ref(),
        options.contrast.as_ref(),
        results.is_some(),
    )?;
    if model.beta_prior() {
        return Err(ShrinkError::IncompatibleModelState {
            reason: "the model was fit with betaPrior=TRUE; refit without the legacy prior before shrinking"
                .to_string(),
        });
    }
    if let Some(res) = results {
        res.ensure_same_rows(model)?;
    }

    let backend = backend_for(options.estimator);
    let ctx = ShrinkContext {
        model,
        target: &target,
        options,
        services,
    };
    backend.validate(&ctx)?;
    let execution = execution_for(options.estimator, options, services)?;

    let base: Cow<'_, ResultsTable> = match results {
        Some(res) => Cow::Borrowed(res),
        None => {
            let res = services.results_provider().results(model, &target)?;
            res.ensure_same_rows(model)?;
            Cow::Owned(res)
        }
    };

    log::info!("Shrinking log2 fold changes with type='{}'", options.estimator);
    let output = backend.shrink(&ctx, &base, &execution)?;
    for warning in &output.warnings {
        log::warn!("{}", warning);
    }
    assemble(&base, options.estimator, output, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CountMatrix, SampleMetadata};
    use crate::glm::{fit_mle, IrlsRidgeFitter};
    use crate::io::ColumnKind;
    use crate::testing::{ResultsProvider, WaldResultsProvider};
    use ndarray::{Array1, Array2};

    fn metadata(levels: &[&str]) -> SampleMetadata {
        let ids: Vec<String> = (1..=levels.len()).map(|i| format!("s{}", i)).collect();
        let mut meta = SampleMetadata::new(ids);
        meta.add_condition("condition", levels.iter().map(|s| s.to_string()).collect())
            .unwrap();
        meta
    }

    /// Counts with a per-level fold change; feature 3 has no counts
    fn counts(n: usize, groups: &[usize]) -> CountMatrix {
        let m = groups.len();
        let mut counts = Array2::zeros((n, m));
        for i in 0..n {
            if i == 3 {
                continue;
            }
            let base = 30.0 + 20.0 * i as f64;
            for (j, &g) in groups.iter().enumerate() {
                let fold = match (i % 4, g) {
                    (0, 1) => 4.0,
                    (1, 1) => 0.25,
                    (2, 2) => 2.0,
                    _ => 1.0,
                };
                let jitter = [0.0, 4.0, -3.0][j % 3];
                counts[[i, j]] = (base * fold + jitter).round();
            }
        }
        CountMatrix::new(
            counts,
            (0..n).map(|i| format!("g{}", i)).collect(),
            (1..=m).map(|i| format!("s{}", i)).collect(),
        )
        .unwrap()
    }

    fn fitted(builder: crate::data::FittedModelBuilder, n: usize) -> FittedModel {
        let model = builder
            .dispersions(Array1::from_elem(n, 0.05))
            .build()
            .unwrap();
        fit_mle(&model, &IrlsRidgeFitter::default()).unwrap()
    }

    /// 10 features, A vs B, three replicates each
    fn two_level() -> FittedModel {
        let groups = [0, 0, 0, 1, 1, 1];
        let builder = FittedModel::builder()
            .counts(counts(10, &groups))
            .metadata(metadata(&["A", "A", "A", "B", "B", "B"]))
            .main_effect("condition")
            .size_factors(Array1::from_vec(vec![1.0, 0.9, 1.1, 1.0, 1.05, 0.95]));
        fitted(builder, 10)
    }

    fn three_level() -> FittedModel {
        let groups = [0, 0, 1, 1, 2, 2];
        let builder = FittedModel::builder()
            .counts(counts(12, &groups))
            .metadata(metadata(&["A", "A", "B", "B", "C", "C"]))
            .main_effect("condition")
            .size_factors(Array1::from_elem(6, 1.0));
        fitted(builder, 12)
    }

    fn coef(i: usize) -> ShrinkOptions {
        ShrinkOptions {
            coefficient: Some(CoefficientRef::Index(i)),
            ..Default::default()
        }
    }

    fn pooled() -> ShrinkServices {
        ShrinkServices::builtin().with_pool(WorkerPool::new(3).unwrap())
    }

    #[test]
    fn test_normal_two_level_scenario() {
        let model = two_level();
        let out = lfc_shrink(&model, None, &coef(2), &ShrinkServices::builtin()).unwrap();

        assert_eq!(out.table.n_rows(), 10);
        assert_eq!(out.table.feature_ids(), model.feature_ids());
        assert_eq!(
            out.table.kinds(),
            vec![
                ColumnKind::EffectSize,
                ColumnKind::StandardError,
                ColumnKind::Statistic,
                ColumnKind::PValue,
                ColumnKind::AdjPValue
            ]
        );
        let info = out.table.prior_info().unwrap();
        assert_eq!(info.estimator_type, EstimatorType::Normal);
        match &info.diagnostics {
            PriorDiagnostics::Normal { prior_variance, .. } => assert!(*prior_variance >= 0.0),
            other => panic!("unexpected diagnostics {:?}", other),
        }
        assert!(out.fit.is_none());

        // Shrunken effects never exceed the MLE in magnitude and keep their sign
        let mle = WaldResultsProvider
            .results(
                &model,
                &ShrinkTarget::Coefficient(ResolvedCoefficient {
                    name: model.coefficient_names()[1].clone(),
                    index: 1,
                }),
            )
            .unwrap();
        let mle = mle.values(ColumnKind::EffectSize).unwrap();
        let shrunk = out.table.values(ColumnKind::EffectSize).unwrap();
        for i in 0..10 {
            assert!(shrunk[i].abs() <= mle[i].abs() + 1e-6, "row {}", i);
            if mle[i].abs() > 0.5 {
                assert_eq!(shrunk[i].signum(), mle[i].signum(), "row {}", i);
            }
        }
        // all-zero feature
        assert_eq!(shrunk[3], 0.0);
    }

    #[test]
    fn test_name_and_index_shrink_identically() {
        let model = two_level();
        let by_name = ShrinkOptions {
            coefficient: Some(CoefficientRef::Name(model.coefficient_names()[1].clone())),
            ..Default::default()
        };
        let a = lfc_shrink(&model, None, &by_name, &ShrinkServices::builtin()).unwrap();
        let b = lfc_shrink(&model, None, &coef(2), &ShrinkServices::builtin()).unwrap();
        assert_eq!(
            a.table.values(ColumnKind::EffectSize).unwrap(),
            b.table.values(ColumnKind::EffectSize).unwrap()
        );
    }

    #[test]
    fn test_parametric_contrast_fails_before_backend_lookup() {
        let model = two_level();
        let options = ShrinkOptions {
            contrast: Some(Contrast::Levels {
                factor: "condition".to_string(),
                numerator: "B".to_string(),
                denominator: "A".to_string(),
            }),
            estimator: EstimatorType::ExternalParametric,
            use_svalues: true,
            ..Default::default()
        };
        let services = ShrinkServices::builtin().with_parametric(None);
        let err = lfc_shrink(&model, None, &options, &services).unwrap_err();
        assert!(matches!(err, ShrinkError::UnsupportedContrast { .. }), "{:?}", err);
    }

    #[test]
    fn test_normal_requires_dispersions() {
        let n = 10;
        let model = FittedModel::builder()
            .counts(counts(n, &[0, 0, 0, 1, 1, 1]))
            .metadata(metadata(&["A", "A", "A", "B", "B", "B"]))
            .main_effect("condition")
            .size_factors(Array1::from_elem(6, 1.0))
            .mle(Array2::zeros((n, 2)), Array2::from_elem((n, 2), 0.1))
            .build()
            .unwrap();
        let err = lfc_shrink(&model, None, &coef(2), &ShrinkServices::builtin()).unwrap_err();
        assert!(matches!(err, ShrinkError::IncompatibleModelState { .. }), "{:?}", err);
    }

    #[test]
    fn test_coefficient_and_contrast_conflict() {
        let model = two_level();
        let options = ShrinkOptions {
            contrast: Some(Contrast::Numeric(vec![0.0, 1.0])),
            ..coef(2)
        };
        let err = lfc_shrink(&model, None, &options, &ShrinkServices::builtin()).unwrap_err();
        assert!(matches!(err, ShrinkError::ConflictingSpec { .. }));

        let err = lfc_shrink(&model, None, &ShrinkOptions::default(), &ShrinkServices::builtin()).unwrap_err();
        assert!(matches!(err, ShrinkError::MissingSpec { .. }));
    }

    #[test]
    fn test_supplied_results_must_match_rows() {
        let model = two_level();
        let short = ResultsTable::new(vec!["g0".to_string()])
            .with_column(ColumnKind::EffectSize, "log2 fold change (MLE)", vec![1.0])
            .unwrap();
        let err = lfc_shrink(&model, Some(&short), &coef(2), &ShrinkServices::builtin()).unwrap_err();
        assert!(matches!(err, ShrinkError::RowMismatch { .. }));
    }

    #[test]
    fn test_parallel_needs_pool() {
        let model = two_level();
        let options = ShrinkOptions {
            parallel: true,
            ..coef(2)
        };
        let err = lfc_shrink(&model, None, &options, &ShrinkServices::builtin()).unwrap_err();
        assert!(matches!(err, ShrinkError::InvalidInput { .. }));
    }

    #[test]
    fn test_normal_serial_and_parallel_agree() {
        let model = two_level();
        let serial = lfc_shrink(&model, None, &coef(2), &ShrinkServices::builtin()).unwrap();
        let options = ShrinkOptions {
            parallel: true,
            chunk_multiplier: 2,
            ..coef(2)
        };
        let parallel = lfc_shrink(&model, None, &options, &pooled()).unwrap();

        assert_eq!(parallel.table.feature_ids(), serial.table.feature_ids());
        for kind in [ColumnKind::EffectSize, ColumnKind::StandardError] {
            let a = serial.table.values(kind).unwrap();
            let b = parallel.table.values(kind).unwrap();
            for i in 0..a.len() {
                assert!((a[i] - b[i]).abs() < 1e-10, "{:?} row {}", kind, i);
            }
        }
    }

    #[test]
    fn test_parametric_serial_and_parallel_agree() {
        let model = two_level();
        let options = ShrinkOptions {
            estimator: EstimatorType::ExternalParametric,
            use_svalues: true,
            ..coef(2)
        };
        let serial = lfc_shrink(&model, None, &options, &ShrinkServices::builtin()).unwrap();
        let parallel = lfc_shrink(
            &model,
            None,
            &ShrinkOptions {
                parallel: true,
                ..options.clone()
            },
            &pooled(),
        )
        .unwrap();

        assert_eq!(
            serial.table.kinds(),
            vec![ColumnKind::EffectSize, ColumnKind::StandardError, ColumnKind::SValue]
        );
        for kind in [ColumnKind::EffectSize, ColumnKind::StandardError, ColumnKind::SValue] {
            let a = serial.table.values(kind).unwrap();
            let b = parallel.table.values(kind).unwrap();
            for i in 0..a.len() {
                assert!(
                    (a[i] - b[i]).abs() < 1e-10 || (a[i].is_nan() && b[i].is_nan()),
                    "{:?} row {}",
                    kind,
                    i
                );
            }
        }
        assert_eq!(
            serial.table.column(ColumnKind::EffectSize).unwrap().description,
            format!("log2 fold change (MAP): {}", model.design_info().coef_labels[1])
        );
    }

    #[test]
    fn test_nonparametric_reshaping_and_fit_detail() {
        let model = two_level();
        let options = ShrinkOptions {
            estimator: EstimatorType::ExternalNonparametric,
            return_fit_detail: true,
            parallel: true,
            ..coef(2)
        };
        let out = lfc_shrink(&model, None, &options, &pooled()).unwrap();
        assert_eq!(
            out.table.kinds(),
            vec![
                ColumnKind::EffectSize,
                ColumnKind::StandardError,
                ColumnKind::PValue,
                ColumnKind::AdjPValue
            ]
        );
        assert!(out.table.values(ColumnKind::SValue).is_none());
        assert!(matches!(out.fit, Some(RawFit::Nonparametric(_))));
        assert!(matches!(
            out.table.prior_info().unwrap().diagnostics,
            PriorDiagnostics::Nonparametric { .. }
        ));
    }

    #[test]
    fn test_nonparametric_with_supplied_results_only() {
        let model = two_level();
        let base = WaldResultsProvider
            .results(
                &model,
                &ShrinkTarget::Coefficient(ResolvedCoefficient {
                    name: model.coefficient_names()[1].clone(),
                    index: 1,
                }),
            )
            .unwrap();
        let options = ShrinkOptions {
            estimator: EstimatorType::ExternalNonparametric,
            use_svalues: true,
            ..Default::default()
        };
        let out = lfc_shrink(&model, Some(&base), &options, &ShrinkServices::builtin()).unwrap();
        assert_eq!(
            out.table.kinds(),
            vec![ColumnKind::EffectSize, ColumnKind::StandardError, ColumnKind::SValue]
        );
        // caller's table is left alone
        assert!(base.prior_info().is_none());
        assert!(base.values(ColumnKind::Statistic).is_some());

        let normal = ShrinkOptions::default();
        let err = lfc_shrink(&model, Some(&base), &normal, &ShrinkServices::builtin()).unwrap_err();
        assert!(matches!(err, ShrinkError::MissingSpec { .. }));
    }

    #[test]
    fn test_missing_backend_is_configuration_error() {
        let model = two_level();
        let options = ShrinkOptions {
            estimator: EstimatorType::ExternalNonparametric,
            ..coef(2)
        };
        let services = ShrinkServices::builtin().with_nonparametric(None);
        let err = lfc_shrink(&model, None, &options, &services).unwrap_err();
        assert!(err.is_configuration_error(), "{:?}", err);
    }

    /// Mixture fit that stops before convergence; row 0 is unusable
    struct StalledMixture;

    impl NonparametricEstimator for StalledMixture {
        fn identity(&self) -> String {
            "stalled".to_string()
        }

        fn fit(&self, betahat: &[f64], sebetahat: &[f64], _args: &BackendArgs) -> Result<NonparametricFit> {
            let n = betahat.len();
            let mut posterior_mean: Vec<f64> = betahat.iter().map(|b| b * 0.5).collect();
            posterior_mean[0] = f64::NAN;
            Ok(NonparametricFit {
                posterior_mean,
                posterior_sd: sebetahat.to_vec(),
                lfsr: vec![0.5; n],
                svalue: vec![0.5; n],
                mixture: MixtureSummary {
                    sd: vec![0.0, 1.0],
                    pi: vec![0.5, 0.5],
                },
                log_likelihood: -1.0,
                converged: false,
            })
        }
    }

    #[test]
    fn test_nonparametric_non_convergence_is_reported() {
        let model = two_level();
        let options = ShrinkOptions {
            estimator: EstimatorType::ExternalNonparametric,
            ..coef(2)
        };
        let services = ShrinkServices::builtin().with_nonparametric(Some(std::sync::Arc::new(StalledMixture)));
        let out = lfc_shrink(&model, None, &options, &services).unwrap();
        assert_eq!(out.warnings.len(), 1);
        let warning = &out.warnings[0];
        assert_eq!(warning.estimator, EstimatorType::ExternalNonparametric);
        assert_eq!(warning.n_features, 9);
        assert_eq!(warning.examples[0], "g1");
        assert_eq!(out.table.prior_info().unwrap().estimator, "stalled");

        let converged = lfc_shrink(&model, None, &options, &ShrinkServices::builtin()).unwrap();
        assert!(converged.warnings.is_empty());
    }

    #[test]
    fn test_normal_rejects_svalues_and_legacy_prior() {
        let model = two_level();
        let options = ShrinkOptions {
            use_svalues: true,
            ..coef(2)
        };
        let err = lfc_shrink(&model, None, &options, &ShrinkServices::builtin()).unwrap_err();
        assert!(matches!(err, ShrinkError::InvalidInput { .. }));

        let n = 10;
        let legacy = FittedModel::builder()
            .counts(counts(n, &[0, 0, 0, 1, 1, 1]))
            .metadata(metadata(&["A", "A", "A", "B", "B", "B"]))
            .main_effect("condition")
            .size_factors(Array1::from_elem(6, 1.0))
            .dispersions(Array1::from_elem(n, 0.05))
            .mle(Array2::zeros((n, 2)), Array2::from_elem((n, 2), 0.1))
            .beta_prior(true)
            .build()
            .unwrap();
        let err = lfc_shrink(&legacy, None, &coef(2), &ShrinkServices::builtin()).unwrap_err();
        assert!(matches!(err, ShrinkError::IncompatibleModelState { .. }));
    }

    #[test]
    fn test_normal_level_contrast() {
        let model = three_level();
        let options = ShrinkOptions {
            contrast: Some(Contrast::Levels {
                factor: "condition".to_string(),
                numerator: "C".to_string(),
                denominator: "B".to_string(),
            }),
            return_fit_detail: true,
            ..Default::default()
        };
        let out = lfc_shrink(&model, None, &options, &ShrinkServices::builtin()).unwrap();
        assert_eq!(out.table.n_rows(), 12);
        let effect = out.table.values(ColumnKind::EffectSize).unwrap();
        let se = out.table.values(ColumnKind::StandardError).unwrap();
        for i in (0..12).filter(|&i| i != 3) {
            assert!(effect[i].is_finite() && se[i] > 0.0, "row {}", i);
        }
        // C vs B is up for rows with i % 4 == 2 and down for i % 4 == 0
        assert!(effect[2] > 0.0);
        assert!(effect[4] < 0.0);

        // the significance columns come from the refit contrast, not the MLE test
        let stat = out.table.values(ColumnKind::Statistic).unwrap();
        let pvalue = out.table.values(ColumnKind::PValue).unwrap();
        let padj = out.table.values(ColumnKind::AdjPValue).unwrap();
        let mle_stat = WaldResultsProvider
            .results(
                &model,
                &resolve_target(&model, None, options.contrast.as_ref(), false).unwrap(),
            )
            .unwrap()
            .values(ColumnKind::Statistic)
            .unwrap()
            .to_vec();
        for i in (0..12).filter(|&i| i != 3) {
            assert!((stat[i] - effect[i] / se[i]).abs() < 1e-10, "row {}", i);
            assert!((pvalue[i] - crate::testing::calculate_pvalue(stat[i])).abs() < 1e-12, "row {}", i);
        }
        assert!((stat[0] - mle_stat[0]).abs() > 1e-6);
        let expected_padj = crate::testing::benjamini_hochberg(pvalue);
        for i in (0..12).filter(|&i| i != 3) {
            assert!((padj[i] - expected_padj[i]).abs() < 1e-12, "row {}", i);
        }
        // refit on the expanded matrix: intercept plus one column per level
        match out.fit {
            Some(RawFit::Normal(fit)) => assert_eq!(fit.coefficient_names.len(), 4),
            other => panic!("unexpected fit {:?}", other),
        }
    }
}
