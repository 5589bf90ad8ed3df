//! Builder pattern for FittedModel
//!
//! Provides a fluent API for assembling a fitted model from its parts:
//! counts, a design (formula over sample metadata or a ready-made matrix),
//! normalization, dispersions, weights and an optional MLE fit.

use ndarray::{Array1, Array2, Array3};
use std::collections::BTreeMap;

use super::model::{CoefficientFit, DesignSpec, FitKind, FittedModel};
use super::{CountMatrix, SampleMetadata};
use crate::error::{Result, ShrinkError};
use crate::glm::{build_design_matrix, check_full_rank, DesignFormula, DesignInfo, ModelMatrixType};

/// Builder for FittedModel
///
/// # Example
///
/// ```ignore
/// let model = FittedModelBuilder::new()
///     .counts(count_matrix)
///     .metadata(sample_metadata)
///     .main_effect("condition")
///     .factor("batch")
///     .size_factors(size_factors)
///     .dispersions(dispersions)
///     .mle(coefficients, standard_errors)
///     .build()?;
/// ```
#[derive(Default)]
pub struct FittedModelBuilder {
    counts: Option<CountMatrix>,
    metadata: Option<SampleMetadata>,
    main_effect: Option<String>,
    factors: Vec<String>,
    continuous: Vec<String>,
    interactions: Vec<(String, String)>,
    reference_levels: BTreeMap<String, String>,
    design_matrix: Option<(Array2<f64>, Vec<String>)>,
    model_matrix_type: ModelMatrixType,
    size_factors: Option<Array1<f64>>,
    normalization_factors: Option<Array2<f64>>,
    dispersions: Option<Array1<f64>>,
    dispersion_fit: Option<Array1<f64>>,
    weights: Option<Array2<f64>>,
    beta_prior: bool,
    mle: Option<(Array2<f64>, Array2<f64>)>,
    mle_covariances: Option<Array3<f64>>,
    converged: Option<Vec<bool>>,
}

impl FittedModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the count matrix (required)
    pub fn counts(mut self, counts: CountMatrix) -> Self {
        self.counts = Some(counts);
        self
    }

    /// Set the sample metadata (required for formula designs)
    pub fn metadata(mut self, metadata: SampleMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set the main effect variable; it is placed last in the design, as in `~ batch + condition`
    pub fn main_effect(mut self, variable: &str) -> Self {
        self.main_effect = Some(variable.to_string());
        self
    }

    /// Add a categorical covariate
    pub fn factor(mut self, name: &str) -> Self {
        if !self.factors.iter().any(|f| f == name) {
            self.factors.push(name.to_string());
        }
        self
    }

    /// Add a continuous covariate
    pub fn continuous(mut self, name: &str) -> Self {
        if !self.continuous.iter().any(|c| c == name) {
            self.continuous.push(name.to_string());
        }
        self
    }

    /// Add an interaction term between two factors
    pub fn interaction(mut self, factor1: &str, factor2: &str) -> Self {
        let pair = (factor1.to_string(), factor2.to_string());
        if !self.interactions.contains(&pair) {
            self.interactions.push(pair);
        }
        self
    }

    /// Set the reference level for a factor (default: alphabetically first)
    pub fn reference_level(mut self, factor: &str, level: &str) -> Self {
        self.reference_levels.insert(factor.to_string(), level.to_string());
        self
    }

    /// Use a user-supplied model matrix instead of a formula
    pub fn design_matrix(mut self, matrix: Array2<f64>, column_names: Vec<String>) -> Self {
        self.design_matrix = Some((matrix, column_names));
        self
    }

    /// Parameterisation the stored fit was produced with
    pub fn model_matrix_type(mut self, matrix_type: ModelMatrixType) -> Self {
        self.model_matrix_type = matrix_type;
        self
    }

    pub fn size_factors(mut self, size_factors: Array1<f64>) -> Self {
        self.size_factors = Some(size_factors);
        self
    }

    /// Gene x sample normalization factors; centered per gene by geometric mean at build time
    pub fn normalization_factors(mut self, nf: Array2<f64>) -> Self {
        self.normalization_factors = Some(nf);
        self
    }

    pub fn dispersions(mut self, dispersions: Array1<f64>) -> Self {
        self.dispersions = Some(dispersions);
        self
    }

    /// Fitted dispersion trend (dispFit)
    pub fn dispersion_fit(mut self, dispersion_fit: Array1<f64>) -> Self {
        self.dispersion_fit = Some(dispersion_fit);
        self
    }

    /// Gene x sample observation weights
    pub fn weights(mut self, weights: Array2<f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Mark the model as fit with the legacy built-in beta prior
    pub fn beta_prior(mut self, beta_prior: bool) -> Self {
        self.beta_prior = beta_prior;
        self
    }

    /// MLE coefficients and standard errors, log2 scale (genes x coefficients)
    pub fn mle(mut self, coefficients: Array2<f64>, standard_errors: Array2<f64>) -> Self {
        self.mle = Some((coefficients, standard_errors));
        self
    }

    /// MLE coefficient covariances, log2 scale (genes x coefficients x coefficients)
    pub fn mle_covariances(mut self, covariances: Array3<f64>) -> Self {
        self.mle_covariances = Some(covariances);
        self
    }

    pub fn converged(mut self, converged: Vec<bool>) -> Self {
        self.converged = Some(converged);
        self
    }

    /// Build the FittedModel
    ///
    /// Returns an error if required fields are missing or any per-feature
    /// quantity disagrees with the count matrix.
    pub fn build(self) -> Result<FittedModel> {
        let counts = self.counts.ok_or_else(|| ShrinkError::InvalidInput {
            reason: "counts is required".to_string(),
        })?;
        let n_genes = counts.n_genes();
        let n_samples = counts.n_samples();

        if let Some(meta) = &self.metadata {
            if meta.sample_ids() != counts.sample_ids() {
                return Err(ShrinkError::InvalidInput {
                    reason: "Sample IDs in counts and metadata do not match".to_string(),
                });
            }
        }

        let (design, design_matrix, design_info) = match (self.design_matrix, self.main_effect) {
            (Some(_), Some(_)) => {
                return Err(ShrinkError::InvalidInput {
                    reason: "supply either a design formula or a design matrix, not both".to_string(),
                })
            }
            (Some((matrix, names)), None) => {
                if matrix.nrows() != n_samples {
                    return Err(ShrinkError::DimensionMismatch {
                        expected: format!("{} design rows", n_samples),
                        got: format!("{}", matrix.nrows()),
                    });
                }
                check_full_rank(&matrix)?;
                let info = DesignInfo::from_matrix(&matrix, names)?;
                (DesignSpec::Matrix, matrix, info)
            }
            (None, Some(main_effect)) => {
                let metadata = self.metadata.as_ref().ok_or_else(|| ShrinkError::InvalidInput {
                    reason: "metadata is required for a formula design".to_string(),
                })?;
                let formula = DesignFormula {
                    main_effect,
                    factors: self.factors,
                    continuous: self.continuous,
                    interactions: self.interactions,
                    reference_levels: self.reference_levels,
                };
                let (matrix, info) = build_design_matrix(metadata, &formula, self.model_matrix_type)?;
                (DesignSpec::Formula(formula), matrix, info)
            }
            (None, None) => {
                return Err(ShrinkError::InvalidInput {
                    reason: "a main_effect or a design matrix is required".to_string(),
                })
            }
        };

        if let Some(sf) = &self.size_factors {
            check_len("size factors", sf.len(), n_samples)?;
            check_positive("size factors", sf.iter())?;
        }

        let normalization_factors = match self.normalization_factors {
            Some(nf) => {
                if nf.dim() != (n_genes, n_samples) {
                    return Err(ShrinkError::DimensionMismatch {
                        expected: format!("{}x{} normalization factors", n_genes, n_samples),
                        got: format!("{:?}", nf.dim()),
                    });
                }
                check_positive("normalization factors", nf.iter())?;
                Some(center_normalization_factors(nf))
            }
            None => None,
        };

        if let Some(disp) = &self.dispersions {
            check_len("dispersions", disp.len(), n_genes)?;
            check_positive("dispersions", disp.iter().filter(|d| !d.is_nan()))?;
        }
        if let Some(disp_fit) = &self.dispersion_fit {
            check_len("dispersion trend values", disp_fit.len(), n_genes)?;
        }

        if let Some(w) = &self.weights {
            if w.dim() != (n_genes, n_samples) {
                return Err(ShrinkError::DimensionMismatch {
                    expected: format!("{}x{} weights", n_genes, n_samples),
                    got: format!("{:?}", w.dim()),
                });
            }
            if w.iter().any(|&x| x < 0.0 || !x.is_finite()) {
                return Err(ShrinkError::InvalidInput {
                    reason: "weights must be non-negative finite values".to_string(),
                });
            }
        }

        let fit = match self.mle {
            Some((coefficients, standard_errors)) => {
                if coefficients.nrows() != n_genes {
                    return Err(ShrinkError::DimensionMismatch {
                        expected: format!("{} coefficient rows", n_genes),
                        got: format!("{}", coefficients.nrows()),
                    });
                }
                let converged = self.converged.unwrap_or_else(|| vec![true; n_genes]);
                Some(CoefficientFit::new(
                    FitKind::Mle,
                    coefficients,
                    standard_errors,
                    self.mle_covariances,
                    converged,
                    &design_info,
                )?)
            }
            None => None,
        };

        Ok(FittedModel {
            counts,
            metadata: self.metadata,
            design,
            design_matrix,
            design_info,
            size_factors: self.size_factors,
            normalization_factors,
            dispersions: self.dispersions,
            dispersion_fit: self.dispersion_fit,
            weights: self.weights,
            beta_prior: self.beta_prior,
            fit,
        })
    }
}

fn check_len(what: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(ShrinkError::DimensionMismatch {
            expected: format!("{} {}", expected, what),
            got: format!("{}", got),
        });
    }
    Ok(())
}

fn check_positive<'a>(what: &str, mut values: impl Iterator<Item = &'a f64>) -> Result<()> {
    if values.any(|&x| !x.is_finite() || x <= 0.0) {
        return Err(ShrinkError::InvalidInput {
            reason: format!("{} must be positive finite values", what),
        });
    }
    Ok(())
}

/// Center each gene's factors by their geometric mean (R: nf / exp(rowMeans(log(nf))))
fn center_normalization_factors(mut nf: Array2<f64>) -> Array2<f64> {
    for mut row in nf.rows_mut() {
        let center = (row.iter().map(|&x| x.ln()).sum::<f64>() / row.len() as f64).exp();
        if center > 0.0 && center.is_finite() {
            row.mapv_inplace(|x| x / center);
        }
    }
    nf
}
