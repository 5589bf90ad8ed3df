//! JSON model bundle: everything a shrinkage run needs from a fitted model
//!
//! Missing values (NA) are written as `null` since JSON has no NaN.

use ndarray::{Array1, Array2, Array3};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::data::{CountMatrix, FittedModel, FittedModelBuilder, SampleMetadata};
use crate::error::{Result, ShrinkError};
use crate::glm::{DesignFormula, ModelMatrixType};

/// User-supplied model matrix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixBundle {
    pub column_names: Vec<String>,
    /// One row per sample
    pub rows: Vec<Vec<f64>>,
}

/// Stored maximum-likelihood fit on the log2 scale
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MleBundle {
    pub coefficients: Vec<Vec<Option<f64>>>,
    pub standard_errors: Vec<Vec<Option<f64>>>,
    #[serde(default)]
    pub covariances: Option<Vec<Vec<Vec<Option<f64>>>>>,
    #[serde(default)]
    pub converged: Option<Vec<bool>>,
}

/// Serialized fitted model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBundle {
    pub feature_ids: Vec<String>,
    pub sample_ids: Vec<String>,
    /// One row per feature
    pub counts: Vec<Vec<f64>>,
    #[serde(default)]
    pub metadata: Option<SampleMetadata>,
    #[serde(default)]
    pub design: Option<DesignFormula>,
    #[serde(default)]
    pub design_matrix: Option<MatrixBundle>,
    #[serde(default)]
    pub model_matrix_type: ModelMatrixType,
    #[serde(default)]
    pub size_factors: Option<Vec<f64>>,
    #[serde(default)]
    pub normalization_factors: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    pub dispersions: Option<Vec<Option<f64>>>,
    #[serde(default)]
    pub dispersion_fit: Option<Vec<Option<f64>>>,
    #[serde(default)]
    pub weights: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    pub beta_prior: bool,
    #[serde(default)]
    pub mle: Option<MleBundle>,
}

impl ModelBundle {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Validate and assemble the fitted model
    pub fn into_model(self) -> Result<FittedModel> {
        let counts = CountMatrix::new(
            rows_to_array2("counts", &self.counts, |v| v)?,
            self.feature_ids,
            self.sample_ids,
        )?;

        let mut builder = FittedModelBuilder::new()
            .counts(counts)
            .model_matrix_type(self.model_matrix_type)
            .beta_prior(self.beta_prior);

        if let Some(metadata) = self.metadata {
            builder = builder.metadata(metadata);
        }
        if let Some(formula) = self.design {
            builder = builder.main_effect(&formula.main_effect);
            for f in &formula.factors {
                builder = builder.factor(f);
            }
            for c in &formula.continuous {
                builder = builder.continuous(c);
            }
            for (a, b) in &formula.interactions {
                builder = builder.interaction(a, b);
            }
            for (factor, level) in &formula.reference_levels {
                builder = builder.reference_level(factor, level);
            }
        }
        if let Some(matrix) = self.design_matrix {
            let x = rows_to_array2("design matrix", &matrix.rows, |v| v)?;
            builder = builder.design_matrix(x, matrix.column_names);
        }
        if let Some(sf) = self.size_factors {
            builder = builder.size_factors(Array1::from(sf));
        }
        if let Some(nf) = self.normalization_factors {
            builder = builder.normalization_factors(rows_to_array2("normalization factors", &nf, |v| v)?);
        }
        if let Some(disp) = self.dispersions {
            builder = builder.dispersions(disp.into_iter().map(na).collect());
        }
        if let Some(fit) = self.dispersion_fit {
            builder = builder.dispersion_fit(fit.into_iter().map(na).collect());
        }
        if let Some(w) = self.weights {
            builder = builder.weights(rows_to_array2("weights", &w, |v| v)?);
        }
        if let Some(mle) = self.mle {
            let coefficients = rows_to_array2("coefficients", &mle.coefficients, na)?;
            let standard_errors = rows_to_array2("standard errors", &mle.standard_errors, na)?;
            builder = builder.mle(coefficients, standard_errors);
            if let Some(cov) = mle.covariances {
                builder = builder.mle_covariances(covariances_to_array3(&cov)?);
            }
            if let Some(converged) = mle.converged {
                builder = builder.converged(converged);
            }
        }

        builder.build()
    }
}

fn na(v: Option<f64>) -> f64 {
    v.unwrap_or(f64::NAN)
}

fn rows_to_array2<T: Copy>(what: &str, rows: &[Vec<T>], conv: impl Fn(T) -> f64) -> Result<Array2<f64>> {
    let n_cols = rows.first().map(|r| r.len()).unwrap_or(0);
    if let Some(bad) = rows.iter().position(|r| r.len() != n_cols) {
        return Err(ShrinkError::DimensionMismatch {
            expected: format!("{} values in every row of {}", n_cols, what),
            got: format!("{} in row {}", rows[bad].len(), bad + 1),
        });
    }
    let flat: Vec<f64> = rows.iter().flat_map(|r| r.iter().map(|&v| conv(v))).collect();
    Array2::from_shape_vec((rows.len(), n_cols), flat).map_err(|e| ShrinkError::InvalidInput {
        reason: format!("malformed {}: {}", what, e),
    })
}

fn covariances_to_array3(cov: &[Vec<Vec<Option<f64>>>]) -> Result<Array3<f64>> {
    let p = cov.first().map(|m| m.len()).unwrap_or(0);
    let mut out = Array3::from_elem((cov.len(), p, p), f64::NAN);
    for (i, matrix) in cov.iter().enumerate() {
        let m = rows_to_array2("covariances", matrix, na)?;
        if m.dim() != (p, p) {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{}x{} covariance per feature", p, p),
                got: format!("{:?} for feature {}", m.dim(), i + 1),
            });
        }
        out.index_axis_mut(ndarray::Axis(0), i).assign(&m);
    }
    Ok(out)
}
