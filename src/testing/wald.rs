//! Wald results for a single coefficient or a contrast

use super::fdr::benjamini_hochberg;
use super::pvalue::calculate_pvalue;
use super::ResultsProvider;
use crate::data::{CoefficientFit, FittedModel};
use crate::error::{Result, ShrinkError};
use crate::io::{ColumnKind, ResultsTable};
use crate::shrinkage::ShrinkTarget;

/// Builds a five-column results table from the model's stored fit.
/// R equivalent: results() after nbinomWaldTest()
#[derive(Debug, Clone, Copy, Default)]
pub struct WaldResultsProvider;

impl WaldResultsProvider {
    pub fn new() -> Self {
        Self
    }
}

/// Effect and its variance for one feature under a weight vector
fn contrast_effect(fit: &CoefficientFit, i: usize, weights: &[f64]) -> (f64, f64) {
    let n_coefs = weights.len();
    let effect: f64 = (0..n_coefs)
        .filter(|&j| weights[j] != 0.0)
        .map(|j| weights[j] * fit.coefficients[[i, j]])
        .sum();

    // c' * Cov * c, or the diagonal approximation without covariances
    let var = match &fit.covariances {
        Some(cov) => {
            let mut sum = 0.0;
            for j in 0..n_coefs {
                for k in 0..n_coefs {
                    if weights[j] != 0.0 && weights[k] != 0.0 {
                        sum += weights[j] * cov[[i, j, k]] * weights[k];
                    }
                }
            }
            sum
        }
        None => (0..n_coefs)
            .filter(|&j| weights[j] != 0.0)
            .map(|j| {
                let se = fit.standard_errors[[i, j]];
                weights[j] * weights[j] * se * se
            })
            .sum(),
    };
    (effect, var)
}

impl ResultsProvider for WaldResultsProvider {
    fn results(&self, model: &FittedModel, target: &ShrinkTarget) -> Result<ResultsTable> {
        let fit = model.fit().ok_or_else(|| ShrinkError::IncompatibleModelState {
            reason: "the model carries no coefficient fit to test".to_string(),
        })?;
        let n_genes = model.n_features();
        let all_zero = model.counts().all_zero_genes();

        let (effect, se, label): (Vec<f64>, Vec<f64>, String) = match target {
            ShrinkTarget::Coefficient(coef) => {
                if coef.index >= fit.n_coefs() {
                    return Err(ShrinkError::InvalidCoefficient {
                        reason: format!("coefficient {} is not part of this fit", coef.name),
                    });
                }
                let label = model.design_info().coef_labels[coef.index].clone();
                (
                    fit.coefficients.column(coef.index).to_vec(),
                    fit.standard_errors.column(coef.index).to_vec(),
                    label,
                )
            }
            ShrinkTarget::Contrast(contrast) => {
                if contrast.weights.len() != fit.n_coefs() {
                    return Err(ShrinkError::InvalidContrast {
                        reason: format!(
                            "contrast has {} weights but the fit has {} coefficients",
                            contrast.weights.len(),
                            fit.n_coefs()
                        ),
                    });
                }
                let (effect, se) = (0..n_genes)
                    .map(|i| {
                        let (e, v) = contrast_effect(fit, i, &contrast.weights);
                        (e, if v > 0.0 { v.sqrt() } else { f64::NAN })
                    })
                    .unzip();
                (effect, se, contrast.label.clone())
            }
            ShrinkTarget::Results => {
                return Err(ShrinkError::MissingSpec {
                    reason: "results can only be generated for a coefficient or a contrast".to_string(),
                })
            }
        };

        let mut lfc = Vec::with_capacity(n_genes);
        let mut lfc_se = Vec::with_capacity(n_genes);
        let mut stat = Vec::with_capacity(n_genes);
        for i in 0..n_genes {
            // R sets LFC=0, SE=0 and NA statistics for allZero genes
            if all_zero[i] {
                lfc.push(0.0);
                lfc_se.push(0.0);
                stat.push(f64::NAN);
                continue;
            }
            lfc.push(effect[i]);
            lfc_se.push(se[i]);
            stat.push(if se[i] > 0.0 && se[i].is_finite() {
                effect[i] / se[i]
            } else {
                f64::NAN
            });
        }
        let pvalues: Vec<f64> = stat.iter().map(|&z| calculate_pvalue(z)).collect();
        let padj = benjamini_hochberg(&pvalues);

        ResultsTable::new(model.feature_ids().to_vec())
            .with_column(
                ColumnKind::EffectSize,
                format!("log2 fold change ({}): {}", fit.kind.tag(), label),
                lfc,
            )?
            .with_column(ColumnKind::StandardError, format!("standard error: {}", label), lfc_se)?
            .with_column(ColumnKind::Statistic, format!("Wald statistic: {}", label), stat)?
            .with_column(ColumnKind::PValue, format!("Wald test p-value: {}", label), pvalues)?
            .with_column(ColumnKind::AdjPValue, "BH adjusted p-values", padj)
    }
}
