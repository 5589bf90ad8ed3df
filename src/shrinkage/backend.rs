//! Backend dispatch: estimator selection, shared context and output shape

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::ashr::AshEstimator;
use super::apeglm::ApeglmEstimator;
use super::assemble::PriorDiagnostics;
use super::coefficient::ShrinkTarget;
use super::nonparametric::{NonparametricBackend, NonparametricEstimator, NonparametricFit};
use super::normal::{NormalBackend, NormalFit};
use super::parametric::{ParametricBackend, ParametricEstimator, ParametricFit};
use super::partition::{Execution, WorkerPool};
use super::prior::{PriorVarianceEstimator, UpperQuantilePriorVariance};
use super::ShrinkOptions;
use crate::data::FittedModel;
use crate::error::{Result, ShrinkError};
use crate::glm::{IrlsRidgeFitter, RidgeFitter};
use crate::io::ResultsTable;
use crate::testing::{ResultsProvider, WaldResultsProvider};

/// Free-form options forwarded to the backend estimator
pub type BackendArgs = BTreeMap<String, serde_json::Value>;

/// Shrinkage estimator.
/// R equivalent: lfcShrink(type = "normal" | "apeglm" | "ashr")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EstimatorType {
    /// Ridge refit with a normal prior
    #[default]
    #[serde(rename = "normal")]
    Normal,
    /// Heavy-tailed parametric prior fit per feature
    #[serde(rename = "apeglm", alias = "external-parametric")]
    ExternalParametric,
    /// Mixture prior fit jointly over all features
    #[serde(rename = "ashr", alias = "external-nonparametric")]
    ExternalNonparametric,
}

impl EstimatorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EstimatorType::Normal => "normal",
            EstimatorType::ExternalParametric => "apeglm",
            EstimatorType::ExternalNonparametric => "ashr",
        }
    }

    /// Whether the estimator can run per partition
    pub fn supports_partitioning(&self) -> bool {
        !matches!(self, EstimatorType::ExternalNonparametric)
    }
}

impl fmt::Display for EstimatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EstimatorType {
    type Err = ShrinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(EstimatorType::Normal),
            "apeglm" | "external-parametric" => Ok(EstimatorType::ExternalParametric),
            "ashr" | "external-nonparametric" => Ok(EstimatorType::ExternalNonparametric),
            other => Err(ShrinkError::InvalidInput {
                reason: format!(
                    "Unknown estimator '{}'. Use 'normal', 'apeglm' or 'ashr'.",
                    other
                ),
            }),
        }
    }
}

/// Per-feature non-convergence, aggregated. Reported, never fatal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceWarning {
    pub estimator: EstimatorType,
    pub n_features: usize,
    /// First few affected feature ids
    pub examples: Vec<String>,
}

impl ConvergenceWarning {
    const MAX_EXAMPLES: usize = 5;

    /// None when no row failed
    pub fn from_rows(estimator: EstimatorType, feature_ids: &[String], failed: &[usize]) -> Option<Self> {
        if failed.is_empty() {
            return None;
        }
        Some(Self {
            estimator,
            n_features: failed.len(),
            examples: failed
                .iter()
                .take(Self::MAX_EXAMPLES)
                .map(|&i| feature_ids[i].clone())
                .collect(),
        })
    }
}

impl fmt::Display for ConvergenceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} feature(s) did not converge in the {} fit (e.g. {})",
            self.n_features,
            self.estimator,
            self.examples.join(", ")
        )
    }
}

/// Raw backend fit, returned on request next to the table
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "estimator", rename_all = "snake_case")]
pub enum RawFit {
    Normal(NormalFit),
    Parametric(ParametricFit),
    Nonparametric(NonparametricFit),
}

/// Uniform backend output, log2 scale
#[derive(Debug, Clone)]
pub struct BackendOutput {
    pub effect_size: Vec<f64>,
    pub standard_error: Vec<f64>,
    pub svalue: Option<Vec<f64>>,
    /// Results recomputed from the refit; their statistic and p-value
    /// columns take the place of the base table's
    pub regenerated: Option<ResultsTable>,
    /// Estimator identity and version
    pub estimator: String,
    pub diagnostics: PriorDiagnostics,
    pub fit: RawFit,
    pub warnings: Vec<ConvergenceWarning>,
}

/// Collaborators a shrinkage call may need. Passed explicitly, never global.
#[derive(Clone)]
pub struct ShrinkServices {
    results_provider: Arc<dyn ResultsProvider>,
    prior_estimator: Arc<dyn PriorVarianceEstimator>,
    ridge_fitter: Arc<dyn RidgeFitter>,
    parametric: Option<Arc<dyn ParametricEstimator>>,
    nonparametric: Option<Arc<dyn NonparametricEstimator>>,
    pool: Option<WorkerPool>,
}

impl fmt::Debug for ShrinkServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShrinkServices")
            .field("parametric", &self.parametric.as_ref().map(|p| p.identity()))
            .field("nonparametric", &self.nonparametric.as_ref().map(|n| n.identity()))
            .field("pool", &self.pool)
            .finish()
    }
}

impl ShrinkServices {
    /// Built-in implementations of every collaborator, no worker pool
    pub fn builtin() -> Self {
        Self {
            results_provider: Arc::new(WaldResultsProvider),
            prior_estimator: Arc::new(UpperQuantilePriorVariance),
            ridge_fitter: Arc::new(IrlsRidgeFitter::default()),
            parametric: Some(Arc::new(ApeglmEstimator::default())),
            nonparametric: Some(Arc::new(AshEstimator::default())),
            pool: None,
        }
    }

    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_results_provider(mut self, provider: Arc<dyn ResultsProvider>) -> Self {
        self.results_provider = provider;
        self
    }

    pub fn with_prior_estimator(mut self, estimator: Arc<dyn PriorVarianceEstimator>) -> Self {
        self.prior_estimator = estimator;
        self
    }

    pub fn with_ridge_fitter(mut self, fitter: Arc<dyn RidgeFitter>) -> Self {
        self.ridge_fitter = fitter;
        self
    }

    pub fn with_parametric(mut self, estimator: Option<Arc<dyn ParametricEstimator>>) -> Self {
        self.parametric = estimator;
        self
    }

    pub fn with_nonparametric(mut self, estimator: Option<Arc<dyn NonparametricEstimator>>) -> Self {
        self.nonparametric = estimator;
        self
    }

    pub fn results_provider(&self) -> &dyn ResultsProvider {
        self.results_provider.as_ref()
    }

    pub fn prior_estimator(&self) -> &dyn PriorVarianceEstimator {
        self.prior_estimator.as_ref()
    }

    pub fn ridge_fitter(&self) -> &dyn RidgeFitter {
        self.ridge_fitter.as_ref()
    }

    pub fn pool(&self) -> Option<&WorkerPool> {
        self.pool.as_ref()
    }

    pub fn parametric(&self) -> Result<&dyn ParametricEstimator> {
        self.parametric
            .as_deref()
            .ok_or_else(|| ShrinkError::BackendUnavailable {
                backend: EstimatorType::ExternalParametric.to_string(),
                reason: "no parametric estimator is registered".to_string(),
            })
    }

    pub fn nonparametric(&self) -> Result<&dyn NonparametricEstimator> {
        self.nonparametric
            .as_deref()
            .ok_or_else(|| ShrinkError::BackendUnavailable {
                backend: EstimatorType::ExternalNonparametric.to_string(),
                reason: "no nonparametric estimator is registered".to_string(),
            })
    }
}

impl Default for ShrinkServices {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Read-only view of one shrinkage call
pub struct ShrinkContext<'a> {
    pub model: &'a FittedModel,
    pub target: &'a ShrinkTarget,
    pub options: &'a ShrinkOptions,
    pub services: &'a ShrinkServices,
}

/// One shrinkage strategy: its own input adapter and output normaliser
pub trait ShrinkageBackend: Send + Sync {
    fn estimator_type(&self) -> EstimatorType;

    /// Preconditions, checked before any numerical work
    fn validate(&self, ctx: &ShrinkContext<'_>) -> Result<()>;

    fn shrink(&self, ctx: &ShrinkContext<'_>, base: &ResultsTable, execution: &Execution) -> Result<BackendOutput>;
}

pub fn backend_for(estimator: EstimatorType) -> Box<dyn ShrinkageBackend> {
    match estimator {
        EstimatorType::Normal => Box::new(NormalBackend),
        EstimatorType::ExternalParametric => Box::new(ParametricBackend),
        EstimatorType::ExternalNonparametric => Box::new(NonparametricBackend),
    }
}

/// Identity string for built-in estimators
pub(crate) fn builtin_identity(name: &str) -> String {
    format!("{} (rust_lfcshrink {})", name, env!("CARGO_PKG_VERSION"))
}

fn bad_arg(key: &str, expected: &str, value: &serde_json::Value) -> ShrinkError {
    ShrinkError::InvalidInput {
        reason: format!("backend argument '{}' must be {}, got {}", key, expected, value),
    }
}

pub(crate) fn arg_f64(key: &str, value: &serde_json::Value) -> Result<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .filter(|v: &f64| v.is_finite())
    .ok_or_else(|| bad_arg(key, "a finite number", value))
}

pub(crate) fn arg_usize(key: &str, value: &serde_json::Value) -> Result<usize> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|v| usize::try_from(v).ok()),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| bad_arg(key, "a non-negative integer", value))
}

pub(crate) fn arg_bool(key: &str, value: &serde_json::Value) -> Result<bool> {
    match value {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| bad_arg(key, "true or false", value))
}
