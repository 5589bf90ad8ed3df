//! Prior variance estimation for the normal (ridge) shrinkage path
//! R equivalent: estimateBetaPriorVar() in core.R

use ndarray::{ArrayView1, ArrayView2};

use crate::data::CoefficientColumn;
use crate::error::{Result, ShrinkError};
use crate::glm::{DesignInfo, ModelMatrixType};
use crate::stats::match_weighted_upper_quantile_for_variance;

/// Name prefix marking a column as an MLE estimate
pub const MLE_PREFIX: &str = "MLE_";

/// Variance given to the intercept and to coefficients with no usable estimate
pub const WIDE_PRIOR_VARIANCE: f64 = 1e6;

/// MLE betas beyond this magnitude (log2) are left out of the quantile
const MAX_ABS_BETA: f64 = 10.0;

fn is_mle_description(description: &str) -> bool {
    description.contains("(MLE)")
}

/// Prefix MLE-derived columns with `MLE_`. Already-tagged columns are left
/// alone, so repeated calls return the same names.
pub fn tag_mle_columns(columns: &[CoefficientColumn]) -> Vec<CoefficientColumn> {
    columns
        .iter()
        .map(|c| {
            let name = if is_mle_description(&c.description) && !c.name.starts_with(MLE_PREFIX) {
                format!("{}{}", MLE_PREFIX, c.name)
            } else {
                c.name.clone()
            };
            CoefficientColumn {
                name,
                description: c.description.clone(),
            }
        })
        .collect()
}

/// Everything prior estimation reads
pub struct PriorVarianceInput<'a> {
    /// Tagged MLE columns, aligned with `mle`
    pub columns: &'a [CoefficientColumn],
    /// genes x coefficients, log2
    pub mle: ArrayView2<'a, f64>,
    /// Design the MLE was fit with
    pub mle_design: &'a DesignInfo,
    pub base_means: ArrayView1<'a, f64>,
    /// Dispersion trend used for the quantile weights
    pub dispersion_fit: ArrayView1<'a, f64>,
    /// Design the prior is for; expanded when the refit uses one indicator per level
    pub target_design: &'a DesignInfo,
    /// Caller-supplied model matrix, when the design did not come from a formula
    pub model_matrix: Option<ArrayView2<'a, f64>>,
    pub upper_quantile: f64,
}

/// One prior variance per column of the target design, log2 scale
#[derive(Debug, Clone, PartialEq)]
pub struct PriorVariance {
    pub coefficient_names: Vec<String>,
    pub variances: Vec<f64>,
}

impl PriorVariance {
    /// Ridge penalties on the log2 scale; intercepts get `intercept_lambda`
    pub fn lambda_log2(&self, design: &DesignInfo, intercept_lambda: f64) -> Vec<f64> {
        self.variances
            .iter()
            .enumerate()
            .map(|(j, &v)| if design.is_intercept(j) { intercept_lambda } else { 1.0 / v })
            .collect()
    }
}

/// Estimates the prior variance of each coefficient from the ensemble of MLEs
pub trait PriorVarianceEstimator: Send + Sync {
    fn estimate(&self, input: &PriorVarianceInput<'_>) -> Result<PriorVariance>;
}

/// Weighted upper-quantile matching: the prior is the zero-centred normal
/// whose (1 - q/2) quantile equals the weighted (1 - q) quantile of |beta|.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpperQuantilePriorVariance;

impl UpperQuantilePriorVariance {
    fn is_intercept_column(input: &PriorVarianceInput<'_>, j: usize) -> bool {
        if input.mle_design.is_intercept(j) {
            return true;
        }
        match &input.model_matrix {
            Some(x) => x.ncols() > j && x.column(j).iter().all(|&v| v == 1.0),
            None => false,
        }
    }
}

impl PriorVarianceEstimator for UpperQuantilePriorVariance {
    fn estimate(&self, input: &PriorVarianceInput<'_>) -> Result<PriorVariance> {
        let (n_genes, n_coefs) = input.mle.dim();
        if input.columns.len() != n_coefs || input.mle_design.n_coefs() != n_coefs {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{} MLE columns", n_coefs),
                got: format!("{}", input.columns.len()),
            });
        }

        let nonzero: Vec<usize> = (0..n_genes).filter(|&i| input.base_means[i] > 0.0).collect();
        if nonzero.is_empty() {
            return Err(ShrinkError::DegenerateModel {
                reason: "every feature has zero counts".to_string(),
            });
        }

        // R: varlogk <- 1/baseMean + dispFit; weights <- 1/varlogk
        let weights: Vec<f64> = nonzero
            .iter()
            .map(|&i| 1.0 / (1.0 / input.base_means[i] + input.dispersion_fit[i]))
            .collect();

        let pooled: Vec<usize> = (0..n_coefs)
            .filter(|&j| input.columns[j].name.starts_with(MLE_PREFIX) && !Self::is_intercept_column(input, j))
            .collect();
        if pooled.is_empty() {
            return Err(ShrinkError::DegenerateModel {
                reason: "no MLE coefficients besides the intercept to estimate a prior from".to_string(),
            });
        }

        let mut mle_var = vec![WIDE_PRIOR_VARIANCE; n_coefs];
        for &j in &pooled {
            let (betas, w): (Vec<f64>, Vec<f64>) = nonzero
                .iter()
                .zip(weights.iter())
                .map(|(&i, &w)| (input.mle[[i, j]], w))
                .filter(|(b, w)| b.is_finite() && b.abs() < MAX_ABS_BETA && w.is_finite() && *w > 0.0)
                .unzip();
            if betas.is_empty() {
                log::warn!("No usable estimates for {}; using a wide prior", input.columns[j].name);
                continue;
            }
            mle_var[j] = match_weighted_upper_quantile_for_variance(&betas, &w, input.upper_quantile);
            log::debug!("prior variance for {}: {:.6}", input.columns[j].name, mle_var[j]);
        }

        let target = input.target_design;
        let variances = match target.matrix_type {
            ModelMatrixType::Standard => {
                if target.n_coefs() != n_coefs {
                    return Err(ShrinkError::DimensionMismatch {
                        expected: format!("{} coefficients in the refit design", n_coefs),
                        got: format!("{}", target.n_coefs()),
                    });
                }
                mle_var
            }
            ModelMatrixType::Expanded => expand_over_levels(input.mle_design, target, &mle_var),
        };

        Ok(PriorVariance {
            coefficient_names: target.coef_names.clone(),
            variances,
        })
    }
}

/// Every level column of a factor gets the mean prior of that factor's
/// standard columns. R equivalent: averagePriorsOverLevels()
fn expand_over_levels(standard: &DesignInfo, expanded: &DesignInfo, standard_var: &[f64]) -> Vec<f64> {
    let mut out = vec![WIDE_PRIOR_VARIANCE; expanded.n_coefs()];
    for term in &expanded.factors {
        let source: Vec<f64> = standard
            .factor(&term.name)
            .map(|t| t.column_indices().iter().map(|&j| standard_var[j]).collect())
            .unwrap_or_default();
        if source.is_empty() {
            continue;
        }
        let mean = source.iter().sum::<f64>() / source.len() as f64;
        for col in term.column_indices() {
            out[col] = mean;
        }
    }
    for (name, &col) in &expanded.continuous_columns {
        if let Some(&j) = standard.continuous_columns.get(name) {
            out[col] = standard_var[j];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SampleMetadata;
    use crate::glm::{build_design_matrix, DesignFormula};
    use ndarray::{Array1, Array2};

    fn column(name: &str, tag: &str) -> CoefficientColumn {
        CoefficientColumn {
            name: name.to_string(),
            description: format!("log2 fold change ({}): {}", tag, name),
        }
    }

    fn designs() -> (DesignInfo, DesignInfo) {
        let ids: Vec<String> = (1..=6).map(|i| format!("s{}", i)).collect();
        let mut meta = SampleMetadata::new(ids);
        meta.add_condition(
            "condition",
            ["A", "A", "B", "B", "C", "C"].iter().map(|s| s.to_string()).collect(),
        )
        .unwrap();
        let formula = DesignFormula::new("condition");
        let standard = build_design_matrix(&meta, &formula, ModelMatrixType::Standard).unwrap().1;
        let expanded = build_design_matrix(&meta, &formula, ModelMatrixType::Expanded).unwrap().1;
        (standard, expanded)
    }

    #[test]
    fn test_tagging_is_idempotent() {
        let cols = vec![column("Intercept", "MLE"), column("trt", "MLE"), column("other", "MAP")];
        let once = tag_mle_columns(&cols);
        let twice = tag_mle_columns(&once);
        assert_eq!(once, twice);
        assert_eq!(once[1].name, "MLE_trt");
        assert_eq!(once[2].name, "other");
        // input untouched
        assert_eq!(cols[1].name, "trt");
    }

    #[test]
    fn test_standard_prior() {
        let (standard, _) = designs();
        let n = 200;
        let mut mle = Array2::zeros((n, 3));
        for i in 0..n {
            let x = (i as f64 / n as f64 - 0.5) * 4.0;
            mle[[i, 1]] = x;
            mle[[i, 2]] = x / 2.0;
        }
        let cols = tag_mle_columns(&standard
            .coef_names
            .iter()
            .map(|n| column(n, "MLE"))
            .collect::<Vec<_>>());
        let base_means = Array1::from_elem(n, 100.0);
        let disp = Array1::from_elem(n, 0.1);
        let input = PriorVarianceInput {
            columns: &cols,
            mle: mle.view(),
            mle_design: &standard,
            base_means: base_means.view(),
            dispersion_fit: disp.view(),
            target_design: &standard,
            model_matrix: None,
            upper_quantile: 0.05,
        };
        let prior = UpperQuantilePriorVariance.estimate(&input).unwrap();

        assert_eq!(prior.variances[0], WIDE_PRIOR_VARIANCE);
        assert!(prior.variances.iter().all(|&v| v >= 0.0));
        // |beta| ~ U(0, 2): 95th percentile 1.9, sd = 1.9 / 1.96
        let expected = (1.9_f64 / 1.959964).powi(2);
        assert!((prior.variances[1] - expected).abs() < 0.05, "got {}", prior.variances[1]);
        assert!(prior.variances[2] < prior.variances[1]);

        let lambda = prior.lambda_log2(&standard, 1e-6);
        assert_eq!(lambda[0], 1e-6);
        assert!((lambda[1] - 1.0 / prior.variances[1]).abs() < 1e-12);
    }

    #[test]
    fn test_expanded_prior_is_averaged() {
        let (standard, expanded) = designs();
        let n = 50;
        let mut mle = Array2::zeros((n, 3));
        for i in 0..n {
            mle[[i, 1]] = (i as f64 - 25.0) / 10.0;
            mle[[i, 2]] = (i as f64 - 25.0) / 20.0;
        }
        let cols = tag_mle_columns(&standard
            .coef_names
            .iter()
            .map(|n| column(n, "MLE"))
            .collect::<Vec<_>>());
        let base_means = Array1::from_elem(n, 50.0);
        let disp = Array1::from_elem(n, 0.05);
        let mut input = PriorVarianceInput {
            columns: &cols,
            mle: mle.view(),
            mle_design: &standard,
            base_means: base_means.view(),
            dispersion_fit: disp.view(),
            target_design: &standard,
            model_matrix: None,
            upper_quantile: 0.05,
        };
        let std_prior = UpperQuantilePriorVariance.estimate(&input).unwrap();
        input.target_design = &expanded;
        let exp_prior = UpperQuantilePriorVariance.estimate(&input).unwrap();

        assert_eq!(exp_prior.variances.len(), 4);
        let mean = (std_prior.variances[1] + std_prior.variances[2]) / 2.0;
        for j in 1..4 {
            assert!((exp_prior.variances[j] - mean).abs() < 1e-12);
        }
        assert_eq!(exp_prior.coefficient_names[1], "condition_A");
    }

    #[test]
    fn test_degenerate_inputs() {
        let (standard, _) = designs();
        let mle = Array2::zeros((3, 3));
        let cols: Vec<CoefficientColumn> = standard.coef_names.iter().map(|n| column(n, "MLE")).collect();
        let base_means = Array1::zeros(3);
        let disp = Array1::from_elem(3, 0.1);
        let input = PriorVarianceInput {
            columns: &cols,
            mle: mle.view(),
            mle_design: &standard,
            base_means: base_means.view(),
            dispersion_fit: disp.view(),
            target_design: &standard,
            model_matrix: None,
            upper_quantile: 0.05,
        };
        // untagged columns and zero base means
        assert!(matches!(
            UpperQuantilePriorVariance.estimate(&input),
            Err(ShrinkError::DegenerateModel { .. })
        ));
    }
}
