//! FittedModel - the read-only model context every shrinkage call works from

use ndarray::{Array1, Array2, Array3, ArrayView2, Axis};

use super::{CountMatrix, SampleMetadata};
use crate::error::{Result, ShrinkError};
use crate::glm::{DesignFormula, DesignInfo, ModelMatrixType};

/// Origin of a design matrix
#[derive(Debug, Clone, PartialEq)]
pub enum DesignSpec {
    /// Built from sample metadata
    Formula(DesignFormula),
    /// Supplied by the caller as a ready-made model matrix
    Matrix,
}

/// Estimator that produced a set of coefficients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitKind {
    /// Unpenalised maximum likelihood
    Mle,
    /// Ridge-penalised maximum a posteriori
    Map,
}

impl FitKind {
    /// Tag carried by column descriptions, e.g. "log2 fold change (MLE): ..."
    pub fn tag(&self) -> &'static str {
        match self {
            FitKind::Mle => "MLE",
            FitKind::Map => "MAP",
        }
    }
}

/// Name and description of a coefficient column
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientColumn {
    pub name: String,
    pub description: String,
}

/// Per-feature coefficients from a GLM fit, all on the log2 scale
#[derive(Debug, Clone)]
pub struct CoefficientFit {
    pub kind: FitKind,
    /// genes x coefficients
    pub coefficients: Array2<f64>,
    /// genes x coefficients
    pub standard_errors: Array2<f64>,
    /// genes x coefficients x coefficients, when the fitter produced them
    pub covariances: Option<Array3<f64>>,
    pub converged: Vec<bool>,
    pub columns: Vec<CoefficientColumn>,
}

impl CoefficientFit {
    /// Assemble a fit and describe its columns from the design.
    pub fn new(
        kind: FitKind,
        coefficients: Array2<f64>,
        standard_errors: Array2<f64>,
        covariances: Option<Array3<f64>>,
        converged: Vec<bool>,
        info: &DesignInfo,
    ) -> Result<Self> {
        let (n_genes, n_coefs) = coefficients.dim();
        if n_coefs != info.n_coefs() {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{} coefficient columns", info.n_coefs()),
                got: format!("{}", n_coefs),
            });
        }
        if standard_errors.dim() != (n_genes, n_coefs) {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{}x{} standard errors", n_genes, n_coefs),
                got: format!("{:?}", standard_errors.dim()),
            });
        }
        if let Some(cov) = &covariances {
            if cov.dim() != (n_genes, n_coefs, n_coefs) {
                return Err(ShrinkError::DimensionMismatch {
                    expected: format!("{}x{}x{} covariances", n_genes, n_coefs, n_coefs),
                    got: format!("{:?}", cov.dim()),
                });
            }
        }
        if converged.len() != n_genes {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{} convergence flags", n_genes),
                got: format!("{}", converged.len()),
            });
        }

        let columns = info
            .coef_names
            .iter()
            .zip(info.coef_labels.iter())
            .map(|(name, label)| CoefficientColumn {
                name: name.clone(),
                description: format!("log2 fold change ({}): {}", kind.tag(), label),
            })
            .collect();

        Ok(Self {
            kind,
            coefficients,
            standard_errors,
            covariances,
            converged,
            columns,
        })
    }

    pub fn n_coefs(&self) -> usize {
        self.coefficients.ncols()
    }
}

/// A negative binomial GLM fit over a count matrix.
///
/// Holds everything the shrinkage engine reads: counts, design, dispersions,
/// normalization, observation weights and the coefficients of the last fit.
/// Shrinkage never mutates a model; refits produce derived copies.
#[derive(Debug, Clone)]
pub struct FittedModel {
    pub(crate) counts: CountMatrix,
    pub(crate) metadata: Option<SampleMetadata>,
    pub(crate) design: DesignSpec,
    pub(crate) design_matrix: Array2<f64>,
    pub(crate) design_info: DesignInfo,
    pub(crate) size_factors: Option<Array1<f64>>,
    pub(crate) normalization_factors: Option<Array2<f64>>,
    pub(crate) dispersions: Option<Array1<f64>>,
    pub(crate) dispersion_fit: Option<Array1<f64>>,
    pub(crate) weights: Option<Array2<f64>>,
    pub(crate) beta_prior: bool,
    pub(crate) fit: Option<CoefficientFit>,
}

impl FittedModel {
    pub fn builder() -> super::builder::FittedModelBuilder {
        super::builder::FittedModelBuilder::new()
    }

    pub fn n_features(&self) -> usize {
        self.counts.n_genes()
    }

    pub fn n_samples(&self) -> usize {
        self.counts.n_samples()
    }

    pub fn feature_ids(&self) -> &[String] {
        self.counts.gene_ids()
    }

    pub fn counts(&self) -> &CountMatrix {
        &self.counts
    }

    pub fn metadata(&self) -> Option<&SampleMetadata> {
        self.metadata.as_ref()
    }

    pub fn design(&self) -> &DesignSpec {
        &self.design
    }

    pub fn design_matrix(&self) -> &Array2<f64> {
        &self.design_matrix
    }

    pub fn design_info(&self) -> &DesignInfo {
        &self.design_info
    }

    /// Ordered coefficient names; position + 1 is the coefficient's index
    pub fn coefficient_names(&self) -> &[String] {
        &self.design_info.coef_names
    }

    pub fn model_matrix_type(&self) -> ModelMatrixType {
        self.design_info.matrix_type
    }

    pub fn size_factors(&self) -> Option<&Array1<f64>> {
        self.size_factors.as_ref()
    }

    pub fn normalization_factors(&self) -> Option<&Array2<f64>> {
        self.normalization_factors.as_ref()
    }

    pub fn dispersions(&self) -> Option<&Array1<f64>> {
        self.dispersions.as_ref()
    }

    /// Dispersion trend used to weight the prior variance estimate,
    /// falling back to the final dispersions when no trend is stored.
    pub fn dispersion_weights_source(&self) -> Option<&Array1<f64>> {
        self.dispersion_fit.as_ref().or(self.dispersions.as_ref())
    }

    pub fn weights(&self) -> Option<&Array2<f64>> {
        self.weights.as_ref()
    }

    /// Whether the model was fit with the legacy built-in beta prior
    pub fn beta_prior(&self) -> bool {
        self.beta_prior
    }

    pub fn fit(&self) -> Option<&CoefficientFit> {
        self.fit.as_ref()
    }

    pub fn has_interactions(&self) -> bool {
        self.design_info.has_interactions()
    }

    pub fn is_user_supplied_design(&self) -> bool {
        matches!(self.design, DesignSpec::Matrix)
    }

    /// Per-observation normalization (genes x samples).
    /// A normalization-factor matrix takes precedence over size factors.
    pub fn normalization_matrix(&self) -> Result<Array2<f64>> {
        if let Some(nf) = &self.normalization_factors {
            return Ok(nf.clone());
        }
        match &self.size_factors {
            Some(sf) => {
                let row = sf.view().insert_axis(Axis(0));
                Ok(row
                    .broadcast((self.n_features(), self.n_samples()))
                    .map(|b| b.to_owned())
                    .ok_or_else(|| ShrinkError::DimensionMismatch {
                        expected: format!("{} size factors", self.n_samples()),
                        got: format!("{}", sf.len()),
                    })?)
            }
            None => Err(ShrinkError::IncompatibleModelState {
                reason: "the model has neither size factors nor normalization factors".to_string(),
            }),
        }
    }

    /// Observation-level log offsets, log of [`normalization_matrix`](Self::normalization_matrix)
    pub fn offset_matrix(&self) -> Result<Array2<f64>> {
        Ok(self.normalization_matrix()?.mapv(f64::ln))
    }

    /// Stored observation weights, or all ones
    pub fn weights_matrix(&self) -> Array2<f64> {
        self.weights
            .clone()
            .unwrap_or_else(|| Array2::ones((self.n_features(), self.n_samples())))
    }

    /// Mean of normalized counts per feature
    pub fn base_means(&self) -> Result<Array1<f64>> {
        let norm = self.normalization_matrix()?;
        let normalized = &self.counts.counts() / &norm;
        normalized
            .mean_axis(Axis(1))
            .ok_or_else(|| ShrinkError::InvalidInput {
                reason: "model has no samples".to_string(),
            })
    }

    /// Raw counts as a view
    pub fn count_view(&self) -> ArrayView2<'_, f64> {
        self.counts.counts()
    }

    /// Derived copy carrying a new coefficient fit. The design may change
    /// (standard to expanded); counts, dispersions and normalization do not.
    pub fn with_fit(&self, design_matrix: Array2<f64>, design_info: DesignInfo, fit: CoefficientFit) -> Result<FittedModel> {
        if design_matrix.nrows() != self.n_samples() || design_matrix.ncols() != design_info.n_coefs() {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{}x{} design matrix", self.n_samples(), design_info.n_coefs()),
                got: format!("{:?}", design_matrix.dim()),
            });
        }
        if fit.coefficients.nrows() != self.n_features() || fit.n_coefs() != design_info.n_coefs() {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{}x{} coefficients", self.n_features(), design_info.n_coefs()),
                got: format!("{:?}", fit.coefficients.dim()),
            });
        }
        let mut derived = self.clone();
        derived.design_matrix = design_matrix;
        derived.design_info = design_info;
        derived.fit = Some(fit);
        Ok(derived)
    }
}
