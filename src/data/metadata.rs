//! Sample metadata: categorical and continuous columns

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, ShrinkError};

/// Sample metadata containing experimental conditions
/// R equivalent: colData(dds) in SummarizedExperiment package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleMetadata {
    sample_ids: Vec<String>,
    /// Categorical columns (column name -> value per sample)
    #[serde(default)]
    conditions: BTreeMap<String, Vec<String>>,
    /// Continuous columns (column name -> value per sample)
    #[serde(default)]
    continuous: BTreeMap<String, Vec<f64>>,
}

impl SampleMetadata {
    pub fn new(sample_ids: Vec<String>) -> Self {
        let mut seen = std::collections::HashSet::new();
        for id in &sample_ids {
            if !seen.insert(id) {
                log::warn!("Duplicate sample ID detected: '{}'", id);
            }
        }
        Self {
            sample_ids,
            conditions: BTreeMap::new(),
            continuous: BTreeMap::new(),
        }
    }

    /// Add a categorical factor column
    pub fn add_condition(&mut self, name: &str, values: Vec<String>) -> Result<()> {
        self.check_len(values.len())?;
        self.conditions.insert(name.to_string(), values);
        Ok(())
    }

    /// Add a continuous covariate column
    pub fn add_continuous(&mut self, name: &str, values: Vec<f64>) -> Result<()> {
        self.check_len(values.len())?;
        self.continuous.insert(name.to_string(), values);
        Ok(())
    }

    fn check_len(&self, got: usize) -> Result<()> {
        if got != self.sample_ids.len() {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{} values", self.sample_ids.len()),
                got: format!("{} values", got),
            });
        }
        Ok(())
    }

    pub fn condition(&self, name: &str) -> Option<&[String]> {
        self.conditions.get(name).map(|v| v.as_slice())
    }

    pub fn continuous_values(&self, name: &str) -> Option<&[f64]> {
        self.continuous.get(name).map(|v| v.as_slice())
    }

    /// Unique levels of a factor, sorted
    pub fn levels(&self, condition: &str) -> Result<Vec<String>> {
        self.conditions
            .get(condition)
            .map(|values| {
                let mut unique = values.clone();
                unique.sort();
                unique.dedup();
                unique
            })
            .ok_or_else(|| ShrinkError::InvalidInput {
                reason: format!("condition '{}' not found", condition),
            })
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }
}
