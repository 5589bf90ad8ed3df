//! Design matrix creation for GLM

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::data::SampleMetadata;
use crate::error::{Result, ShrinkError};

/// Coefficient parameterisation of the model matrix.
/// R equivalent: modelMatrixType attribute ("standard" / "expanded")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelMatrixType {
    /// Intercept plus treatment contrasts against each factor's reference level
    #[default]
    Standard,
    /// Intercept plus one indicator column per level of every factor
    Expanded,
}

/// Formula-style design description: `~ factors + main_effect + continuous + interactions`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DesignFormula {
    pub main_effect: String,
    #[serde(default)]
    pub factors: Vec<String>,
    #[serde(default)]
    pub continuous: Vec<String>,
    #[serde(default)]
    pub interactions: Vec<(String, String)>,
    #[serde(default)]
    pub reference_levels: BTreeMap<String, String>,
}

impl DesignFormula {
    pub fn new(main_effect: &str) -> Self {
        Self {
            main_effect: main_effect.to_string(),
            ..Default::default()
        }
    }

    /// Factor names in model-matrix column order (covariates first, main effect last)
    pub fn factor_order(&self) -> Vec<&str> {
        self.factors
            .iter()
            .map(|f| f.as_str())
            .filter(|f| *f != self.main_effect)
            .chain(std::iter::once(self.main_effect.as_str()))
            .collect()
    }
}

/// One categorical term of the design and the columns it owns
#[derive(Debug, Clone, PartialEq)]
pub struct FactorTerm {
    pub name: String,
    pub reference: String,
    /// All levels, sorted
    pub levels: Vec<String>,
    /// (level, column index) for every level with its own column
    pub columns: Vec<(String, usize)>,
}

impl FactorTerm {
    /// Column encoding `level`, None for the reference level of a standard design
    pub fn column_for(&self, level: &str) -> Option<usize> {
        self.columns.iter().find(|(l, _)| l == level).map(|&(_, c)| c)
    }

    pub fn has_level(&self, level: &str) -> bool {
        self.levels.iter().any(|l| l == level)
    }

    pub fn column_indices(&self) -> Vec<usize> {
        self.columns.iter().map(|&(_, c)| c).collect()
    }
}

/// Information about the design matrix
#[derive(Debug, Clone, PartialEq)]
pub struct DesignInfo {
    /// Names of the coefficients, in column order
    pub coef_names: Vec<String>,
    /// Human-readable label per coefficient ("condition B vs A")
    pub coef_labels: Vec<String>,
    pub matrix_type: ModelMatrixType,
    pub intercept: Option<usize>,
    pub factors: Vec<FactorTerm>,
    pub continuous_columns: BTreeMap<String, usize>,
    pub interaction_columns: Vec<usize>,
}

impl DesignInfo {
    /// Design info for a user-supplied model matrix.
    /// The intercept is a column named "Intercept" or, failing that, a constant column of ones.
    pub fn from_matrix(matrix: &Array2<f64>, column_names: Vec<String>) -> Result<Self> {
        if column_names.len() != matrix.ncols() {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{} column names", matrix.ncols()),
                got: format!("{} column names", column_names.len()),
            });
        }
        let intercept = column_names
            .iter()
            .position(|n| n == "Intercept" || n == "(Intercept)")
            .or_else(|| (0..matrix.ncols()).find(|&j| matrix.column(j).iter().all(|&v| v == 1.0)));

        Ok(Self {
            coef_labels: column_names.clone(),
            coef_names: column_names,
            matrix_type: ModelMatrixType::Standard,
            intercept,
            factors: Vec::new(),
            continuous_columns: BTreeMap::new(),
            interaction_columns: Vec::new(),
        })
    }

    pub fn n_coefs(&self) -> usize {
        self.coef_names.len()
    }

    pub fn factor(&self, name: &str) -> Option<&FactorTerm> {
        self.factors.iter().find(|f| f.name == name)
    }

    pub fn has_interactions(&self) -> bool {
        !self.interaction_columns.is_empty()
    }

    pub fn is_intercept(&self, col: usize) -> bool {
        self.intercept == Some(col)
    }
}

fn reference_for(formula: &DesignFormula, factor: &str, levels: &[String]) -> Result<String> {
    match formula.reference_levels.get(factor) {
        Some(level) if levels.contains(level) => Ok(level.clone()),
        Some(level) => Err(ShrinkError::InvalidDesignMatrix {
            reason: format!(
                "Reference level '{}' does not exist in factor '{}'. Available levels: {:?}",
                level, factor, levels
            ),
        }),
        None => levels.first().cloned().ok_or_else(|| ShrinkError::InvalidDesignMatrix {
            reason: format!("No levels found for variable '{}'", factor),
        }),
    }
}

/// Create a design matrix from sample metadata and a design formula.
/// R equivalent: model.matrix() / getModelMatrix() in core.R
///
/// Column order: intercept, covariate factors, main effect, continuous
/// covariates, interactions. Standard matrices use `factor_level_vs_ref`
/// treatment contrasts; expanded matrices carry a `factor_level` indicator for
/// every level and are rank deficient by construction (identified by the ridge
/// penalty at fit time).
pub fn build_design_matrix(
    metadata: &SampleMetadata,
    formula: &DesignFormula,
    matrix_type: ModelMatrixType,
) -> Result<(Array2<f64>, DesignInfo)> {
    let n_samples = metadata.n_samples();

    let mut coef_names = vec!["Intercept".to_string()];
    let mut coef_labels = vec!["Intercept".to_string()];
    let mut columns: Vec<Vec<f64>> = vec![vec![1.0; n_samples]];
    let mut factors = Vec::new();

    for factor in formula.factor_order() {
        let values = metadata.condition(factor).ok_or_else(|| ShrinkError::InvalidDesignMatrix {
            reason: format!("Variable '{}' not found in metadata", factor),
        })?;
        let levels = metadata.levels(factor)?;
        let reference = reference_for(formula, factor, &levels)?;

        let mut term_columns = Vec::new();
        for level in &levels {
            let (name, label) = match matrix_type {
                ModelMatrixType::Standard if *level == reference => continue,
                ModelMatrixType::Standard => (
                    format!("{}_{}_vs_{}", factor, level, reference),
                    format!("{} {} vs {}", factor, level, reference),
                ),
                ModelMatrixType::Expanded => (format!("{}_{}", factor, level), format!("{} {}", factor, level)),
            };
            term_columns.push((level.clone(), columns.len()));
            coef_names.push(name);
            coef_labels.push(label);
            columns.push(values.iter().map(|v| if v == level { 1.0 } else { 0.0 }).collect());
        }

        factors.push(FactorTerm {
            name: factor.to_string(),
            reference,
            levels,
            columns: term_columns,
        });
    }

    let mut continuous_columns = BTreeMap::new();
    for cont in &formula.continuous {
        let values = metadata
            .continuous_values(cont)
            .ok_or_else(|| ShrinkError::InvalidDesignMatrix {
                reason: format!("Continuous variable '{}' not found in metadata", cont),
            })?;
        continuous_columns.insert(cont.clone(), columns.len());
        coef_names.push(cont.clone());
        coef_labels.push(cont.clone());
        columns.push(values.to_vec());
    }

    let mut interaction_columns = Vec::new();
    if !formula.interactions.is_empty() && matrix_type == ModelMatrixType::Expanded {
        return Err(ShrinkError::InvalidDesignMatrix {
            reason: "expanded model matrices do not support interaction terms".to_string(),
        });
    }
    for (f1, f2) in &formula.interactions {
        let term1 = factors.iter().find(|t| &t.name == f1).cloned();
        let term2 = factors.iter().find(|t| &t.name == f2).cloned();
        let (term1, term2) = match (term1, term2) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return Err(ShrinkError::InvalidDesignMatrix {
                    reason: format!("Interaction '{}:{}' references a factor not in the design", f1, f2),
                })
            }
        };
        for (l1, c1) in &term1.columns {
            for (l2, c2) in &term2.columns {
                let name = format!("{}_{}_x_{}_{}", f1, l1, f2, l2);
                interaction_columns.push(columns.len());
                coef_labels.push(format!("{}{}.{}{}", f1, l1, f2, l2));
                coef_names.push(name);
                let col: Vec<f64> = (0..n_samples).map(|i| columns[*c1][i] * columns[*c2][i]).collect();
                columns.push(col);
            }
        }
    }

    let mut design = Array2::zeros((n_samples, columns.len()));
    for (j, col) in columns.iter().enumerate() {
        for (i, &v) in col.iter().enumerate() {
            design[[i, j]] = v;
        }
    }

    if matrix_type == ModelMatrixType::Standard {
        check_full_rank(&design)?;
    }

    let info = DesignInfo {
        coef_names,
        coef_labels,
        matrix_type,
        intercept: Some(0),
        factors,
        continuous_columns,
        interaction_columns,
    };
    Ok((design, info))
}

/// Check if a design matrix is full rank using QR decomposition with column pivoting.
/// R equivalent: checkFullRank() in DESeq2
pub fn check_full_rank(matrix: &Array2<f64>) -> Result<()> {
    let (nrow, ncol) = matrix.dim();
    if nrow == 0 || ncol == 0 {
        return Err(ShrinkError::InvalidDesignMatrix {
            reason: "Design matrix has zero rows or columns".to_string(),
        });
    }

    if qr_rank(matrix) < ncol {
        let has_zero_column = (0..ncol).any(|j| matrix.column(j).iter().all(|&v| v == 0.0));
        let reason = if has_zero_column {
            "the model matrix is not full rank: levels or combinations of levels without any samples \
             have resulted in column(s) of zeros"
        } else {
            "the model matrix is not full rank: one or more variables or interaction terms are linear \
             combinations of the others"
        };
        return Err(ShrinkError::InvalidDesignMatrix {
            reason: reason.to_string(),
        });
    }
    Ok(())
}

/// Numerical rank via Householder QR with column pivoting.
/// Tolerance: `max(nrow, ncol) * eps * max(|diag(R)|)`, as R's qr().
fn qr_rank(matrix: &Array2<f64>) -> usize {
    let (nrow, ncol) = matrix.dim();
    let k = nrow.min(ncol);
    let mut r = matrix.to_owned();

    let mut col_norms_sq: Vec<f64> = (0..ncol).map(|j| r.column(j).iter().map(|&v| v * v).sum()).collect();

    for step in 0..k {
        let best_col = (step..ncol)
            .max_by(|&a, &b| {
                col_norms_sq[a]
                    .partial_cmp(&col_norms_sq[b])
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(step);
        if best_col != step {
            for i in 0..nrow {
                r.swap([i, step], [i, best_col]);
            }
            col_norms_sq.swap(step, best_col);
        }

        let mut alpha = (step..nrow).map(|i| r[[i, step]] * r[[i, step]]).sum::<f64>().sqrt();
        if alpha < f64::EPSILON * 1e3 {
            break;
        }
        if r[[step, step]] > 0.0 {
            alpha = -alpha;
        }

        let v0 = r[[step, step]] - alpha;
        r[[step, step]] = alpha;
        let v_norm_sq = v0 * v0 + ((step + 1)..nrow).map(|i| r[[i, step]] * r[[i, step]]).sum::<f64>();
        if v_norm_sq < f64::MIN_POSITIVE {
            continue;
        }
        let tau = 2.0 / v_norm_sq;

        for j in (step + 1)..ncol {
            let dot = v0 * r[[step, j]] + ((step + 1)..nrow).map(|i| r[[i, step]] * r[[i, j]]).sum::<f64>();
            let scale = tau * dot;
            r[[step, j]] -= scale * v0;
            for i in (step + 1)..nrow {
                r[[i, j]] -= scale * r[[i, step]];
            }
            col_norms_sq[j] = (col_norms_sq[j] - r[[step, j]] * r[[step, j]]).max(0.0);
        }
    }

    let max_abs_diag = (0..k).map(|i| r[[i, i]].abs()).fold(0.0f64, f64::max);
    let tol = nrow.max(ncol) as f64 * f64::EPSILON * max_abs_diag;
    (0..k).filter(|&i| r[[i, i]].abs() > tol).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_factor_metadata() -> SampleMetadata {
        let ids: Vec<String> = (1..=6).map(|i| format!("s{}", i)).collect();
        let mut meta = SampleMetadata::new(ids);
        meta.add_condition(
            "condition",
            ["A", "A", "A", "B", "B", "B"].iter().map(|s| s.to_string()).collect(),
        )
        .unwrap();
        meta.add_condition(
            "batch",
            ["x", "y", "x", "y", "x", "y"].iter().map(|s| s.to_string()).collect(),
        )
        .unwrap();
        meta.add_continuous("age", vec![30.0, 41.0, 25.0, 33.0, 52.0, 47.0]).unwrap();
        meta
    }

    #[test]
    fn test_standard_design() {
        let meta = two_factor_metadata();
        let mut formula = DesignFormula::new("condition");
        formula.factors.push("batch".to_string());

        let (design, info) = build_design_matrix(&meta, &formula, ModelMatrixType::Standard).unwrap();

        assert_eq!(design.dim(), (6, 3));
        assert_eq!(info.coef_names, vec!["Intercept", "batch_y_vs_x", "condition_B_vs_A"]);
        assert_eq!(info.coef_labels[2], "condition B vs A");
        assert_eq!(design[[3, 2]], 1.0);
        assert_eq!(design[[0, 2]], 0.0);
        assert_eq!(info.factor("condition").unwrap().column_for("A"), None);
        assert_eq!(info.factor("condition").unwrap().column_for("B"), Some(2));
    }

    #[test]
    fn test_reference_level_override() {
        let meta = two_factor_metadata();
        let mut formula = DesignFormula::new("condition");
        formula.reference_levels.insert("condition".to_string(), "B".to_string());

        let (_, info) = build_design_matrix(&meta, &formula, ModelMatrixType::Standard).unwrap();
        assert_eq!(info.coef_names, vec!["Intercept", "condition_A_vs_B"]);

        formula.reference_levels.insert("condition".to_string(), "Z".to_string());
        assert!(build_design_matrix(&meta, &formula, ModelMatrixType::Standard).is_err());
    }

    #[test]
    fn test_expanded_design() {
        let meta = two_factor_metadata();
        let mut formula = DesignFormula::new("condition");
        formula.continuous.push("age".to_string());

        let (design, info) = build_design_matrix(&meta, &formula, ModelMatrixType::Expanded).unwrap();
        assert_eq!(info.coef_names, vec!["Intercept", "condition_A", "condition_B", "age"]);
        assert_eq!(design.dim(), (6, 4));
        assert_eq!(design[[0, 1]] + design[[0, 2]], 1.0);
        assert_eq!(info.continuous_columns["age"], 3);
    }

    #[test]
    fn test_interaction_columns() {
        let meta = two_factor_metadata();
        let mut formula = DesignFormula::new("condition");
        formula.factors.push("batch".to_string());
        formula.interactions.push(("batch".to_string(), "condition".to_string()));

        let (design, info) = build_design_matrix(&meta, &formula, ModelMatrixType::Standard).unwrap();
        assert!(info.has_interactions());
        assert_eq!(info.coef_names[3], "batch_y_x_condition_B");
        // s4 is batch y, condition B
        assert_eq!(design[[3, 3]], 1.0);
        assert_eq!(design[[1, 3]], 0.0);
    }

    #[test]
    fn test_user_matrix_intercept_detection() {
        let matrix = array![[1.0, 0.0], [1.0, 0.0], [1.0, 1.0], [1.0, 1.0]];
        let info = DesignInfo::from_matrix(&matrix, vec!["const".to_string(), "trt".to_string()]).unwrap();
        assert_eq!(info.intercept, Some(0));
        assert!(DesignInfo::from_matrix(&matrix, vec!["x".to_string()]).is_err());
    }

    #[test]
    fn test_check_full_rank_valid() {
        let matrix = array![[1.0, 0.0], [1.0, 0.0], [1.0, 1.0], [1.0, 1.0]];
        assert!(check_full_rank(&matrix).is_ok());
    }

    #[test]
    fn test_check_full_rank_zero_column() {
        let matrix = array![[1.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [1.0, 1.0, 0.0]];
        let msg = format!("{}", check_full_rank(&matrix).unwrap_err());
        assert!(msg.contains("column(s) of zeros"), "got: {}", msg);
    }

    #[test]
    fn test_check_full_rank_linear_combination() {
        let matrix = array![[1.0, 0.0, 1.0], [1.0, 0.0, 1.0], [1.0, 1.0, 2.0], [1.0, 1.0, 2.0]];
        let msg = format!("{}", check_full_rank(&matrix).unwrap_err());
        assert!(msg.contains("linear combinations"), "got: {}", msg);
    }

    #[test]
    fn test_check_full_rank_wide_matrix() {
        let matrix = array![[1.0, 0.0, 1.0], [0.0, 1.0, 1.0]];
        assert!(check_full_rank(&matrix).is_err());
    }
}
