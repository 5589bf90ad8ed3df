//! Results table: one row per feature, ordered described columns

use serde::{Deserialize, Serialize};

use crate::data::FittedModel;
use crate::error::{Result, ShrinkError};
use crate::shrinkage::PriorInfo;

/// Role of a results column
/// R equivalent: the log2FoldChange / lfcSE / stat / pvalue / padj / svalue columns of DESeqResults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ColumnKind {
    EffectSize,
    StandardError,
    Statistic,
    PValue,
    AdjPValue,
    SValue,
}

impl ColumnKind {
    pub const ALL: [ColumnKind; 6] = [
        ColumnKind::EffectSize,
        ColumnKind::StandardError,
        ColumnKind::Statistic,
        ColumnKind::PValue,
        ColumnKind::AdjPValue,
        ColumnKind::SValue,
    ];

    /// Column header used in tabular output
    pub fn header(&self) -> &'static str {
        match self {
            ColumnKind::EffectSize => "log2FoldChange",
            ColumnKind::StandardError => "lfcSE",
            ColumnKind::Statistic => "stat",
            ColumnKind::PValue => "pvalue",
            ColumnKind::AdjPValue => "padj",
            ColumnKind::SValue => "svalue",
        }
    }

    pub fn from_header(header: &str) -> Option<ColumnKind> {
        Self::ALL.iter().copied().find(|k| k.header() == header)
    }

    /// Description given to a column read back from a file
    pub fn default_description(&self) -> &'static str {
        match self {
            ColumnKind::EffectSize => "log2 fold change (MLE)",
            ColumnKind::StandardError => "standard error",
            ColumnKind::Statistic => "Wald statistic",
            ColumnKind::PValue => "Wald test p-value",
            ColumnKind::AdjPValue => "BH adjusted p-values",
            ColumnKind::SValue => "s-value",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultColumn {
    pub kind: ColumnKind,
    pub description: String,
    pub values: Vec<f64>,
}

/// Per-feature results with column descriptions and optional shrinkage provenance.
/// R equivalent: DESeqResults S4 class in AllClasses.R
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsTable {
    feature_ids: Vec<String>,
    columns: Vec<ResultColumn>,
    prior_info: Option<PriorInfo>,
}

impl ResultsTable {
    /// Empty table over the given features
    pub fn new(feature_ids: Vec<String>) -> Self {
        Self {
            feature_ids,
            columns: Vec::new(),
            prior_info: None,
        }
    }

    /// Append a column; lengths must match and each kind may appear once
    pub fn with_column(mut self, kind: ColumnKind, description: impl Into<String>, values: Vec<f64>) -> Result<Self> {
        if values.len() != self.feature_ids.len() {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{} values in column {}", self.feature_ids.len(), kind.header()),
                got: format!("{}", values.len()),
            });
        }
        if self.column(kind).is_some() {
            return Err(ShrinkError::InvalidInput {
                reason: format!("column {} already present", kind.header()),
            });
        }
        self.columns.push(ResultColumn {
            kind,
            description: description.into(),
            values,
        });
        Ok(self)
    }

    /// Copy of this table with provenance attached
    pub(crate) fn with_prior_info(mut self, prior_info: PriorInfo) -> Self {
        self.prior_info = Some(prior_info);
        self
    }

    pub fn n_rows(&self) -> usize {
        self.feature_ids.len()
    }

    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    pub fn columns(&self) -> &[ResultColumn] {
        &self.columns
    }

    pub fn kinds(&self) -> Vec<ColumnKind> {
        self.columns.iter().map(|c| c.kind).collect()
    }

    pub fn column(&self, kind: ColumnKind) -> Option<&ResultColumn> {
        self.columns.iter().find(|c| c.kind == kind)
    }

    pub fn values(&self, kind: ColumnKind) -> Option<&[f64]> {
        self.column(kind).map(|c| c.values.as_slice())
    }

    /// Values of a column that must be present
    pub fn require(&self, kind: ColumnKind) -> Result<&[f64]> {
        self.values(kind).ok_or_else(|| ShrinkError::InvalidInput {
            reason: format!("results table has no {} column", kind.header()),
        })
    }

    pub fn prior_info(&self) -> Option<&PriorInfo> {
        self.prior_info.as_ref()
    }

    /// Row identity check against a model: same count, same feature ids, same order
    pub fn ensure_same_rows(&self, model: &FittedModel) -> Result<()> {
        if self.n_rows() != model.n_features() {
            return Err(ShrinkError::RowMismatch {
                reason: format!(
                    "results have {} rows but the model has {} features",
                    self.n_rows(),
                    model.n_features()
                ),
            });
        }
        if let Some((i, (a, b))) = self
            .feature_ids
            .iter()
            .zip(model.feature_ids().iter())
            .enumerate()
            .find(|(_, (a, b))| a != b)
        {
            return Err(ShrinkError::RowMismatch {
                reason: format!("row {} is '{}' in the results but '{}' in the model", i + 1, a, b),
            });
        }
        Ok(())
    }
}
