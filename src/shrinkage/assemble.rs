//! Result assembly: shrunken values into a fresh results table
//! R equivalent: the tail of lfcShrink() (mcols descriptions, priorInfo, svalue columns)

use serde::{Deserialize, Serialize};

use super::backend::{BackendOutput, ConvergenceWarning, EstimatorType, RawFit};
use super::nonparametric::MixtureSummary;
use super::parametric::{ParametricMethod, PriorControl};
use super::ShrinkOptions;
use crate::error::Result;
use crate::io::{ColumnKind, ResultsTable};

/// Estimator-specific summary of the fitted prior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PriorDiagnostics {
    Normal {
        /// Prior variance of the shrunken effect, log2 scale
        prior_variance: f64,
        per_coefficient: Vec<(String, f64)>,
    },
    Parametric {
        prior_control: PriorControl,
        method: ParametricMethod,
        not_converged: usize,
    },
    Nonparametric {
        mixture: MixtureSummary,
        log_likelihood: f64,
    },
}

/// Shrinkage provenance attached to a results table.
/// R equivalent: priorInfo(res)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorInfo {
    pub estimator_type: EstimatorType,
    pub estimator: String,
    pub diagnostics: PriorDiagnostics,
}

/// Result of a shrinkage call
#[derive(Debug, Clone)]
pub struct ShrinkOutput {
    pub table: ResultsTable,
    /// Raw backend output, only with `return_fit_detail`
    pub fit: Option<RawFit>,
    pub warnings: Vec<ConvergenceWarning>,
}

fn effect_tag(estimator_type: EstimatorType) -> &'static str {
    match estimator_type {
        EstimatorType::Normal | EstimatorType::ExternalParametric => "MAP",
        EstimatorType::ExternalNonparametric => "posterior mean",
    }
}

fn retag_effect(description: &str, tag: &str) -> String {
    let new_tag = format!("({})", tag);
    if description.contains("(MLE)") {
        description.replacen("(MLE)", &new_tag, 1)
    } else if description.contains(&new_tag) {
        description.to_string()
    } else {
        format!("{} {}", description, new_tag)
    }
}

fn retag_standard_error(description: &str) -> String {
    if description.contains("standard error") {
        description.replacen("standard error", "posterior SD", 1)
    } else if description.starts_with("posterior SD") {
        description.to_string()
    } else {
        format!("posterior SD: {}", description)
    }
}

/// Columns carried over from the base table after effect and SE
fn kept_kinds(estimator_type: EstimatorType, svalues: bool) -> &'static [ColumnKind] {
    match (estimator_type, svalues) {
        (_, true) => &[],
        (EstimatorType::Normal, false) => &[ColumnKind::Statistic, ColumnKind::PValue, ColumnKind::AdjPValue],
        (_, false) => &[ColumnKind::PValue, ColumnKind::AdjPValue],
    }
}

/// Build the shrunken table from the base results and a backend output.
/// The base table is not modified.
pub fn assemble(
    base: &ResultsTable,
    estimator_type: EstimatorType,
    output: BackendOutput,
    options: &ShrinkOptions,
) -> Result<ShrinkOutput> {
    let effect_description = base
        .column(ColumnKind::EffectSize)
        .map(|c| c.description.as_str())
        .unwrap_or_else(|| ColumnKind::EffectSize.default_description());
    let se_description = base
        .column(ColumnKind::StandardError)
        .map(|c| c.description.as_str())
        .unwrap_or_else(|| ColumnKind::StandardError.default_description());

    let se_description = match estimator_type {
        EstimatorType::Normal => se_description.to_string(),
        _ => retag_standard_error(se_description),
    };

    let mut table = ResultsTable::new(base.feature_ids().to_vec())
        .with_column(
            ColumnKind::EffectSize,
            retag_effect(effect_description, effect_tag(estimator_type)),
            output.effect_size,
        )?
        .with_column(ColumnKind::StandardError, se_description, output.standard_error)?;

    let significance = output.regenerated.as_ref().unwrap_or(base);
    for &kind in kept_kinds(estimator_type, output.svalue.is_some()) {
        if let Some(column) = significance.column(kind) {
            table = table.with_column(kind, column.description.clone(), column.values.clone())?;
        }
    }
    if let Some(svalue) = output.svalue {
        table = table.with_column(ColumnKind::SValue, ColumnKind::SValue.default_description(), svalue)?;
    }

    let table = table.with_prior_info(PriorInfo {
        estimator_type,
        estimator: output.estimator,
        diagnostics: output.diagnostics,
    });

    Ok(ShrinkOutput {
        table,
        fit: options.return_fit_detail.then_some(output.fit),
        warnings: output.warnings,
    })
}
