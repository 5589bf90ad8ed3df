//! Count matrix representation for RNA-seq data

use std::collections::HashMap;

use ndarray::{Array2, ArrayView2, Axis};

use crate::error::{Result, ShrinkError};

/// Deduplicate names by appending _1, _2, etc. to duplicates
fn deduplicate_names(names: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for name in &names {
        *seen.entry(name.as_str()).or_insert(0) += 1;
    }
    if seen.values().all(|&c| c == 1) {
        return names;
    }

    let mut counter: HashMap<String, usize> = HashMap::new();
    names
        .into_iter()
        .map(|name| {
            let count = counter.entry(name.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                name
            } else {
                let renamed = format!("{}_{}", name, *count - 1);
                log::warn!("Duplicate feature id '{}' renamed to '{}'", name, renamed);
                renamed
            }
        })
        .collect()
}

/// Read counts for every feature of a fitted model.
/// Rows are features (genes), columns are samples.
#[derive(Debug, Clone)]
pub struct CountMatrix {
    counts: Array2<f64>,
    gene_ids: Vec<String>,
    sample_ids: Vec<String>,
}

impl CountMatrix {
    /// Create a new count matrix from raw data
    pub fn new(counts: Array2<f64>, gene_ids: Vec<String>, sample_ids: Vec<String>) -> Result<Self> {
        let (n_genes, n_samples) = counts.dim();

        if gene_ids.len() != n_genes {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{} gene IDs", n_genes),
                got: format!("{} gene IDs", gene_ids.len()),
            });
        }

        if sample_ids.len() != n_samples {
            return Err(ShrinkError::DimensionMismatch {
                expected: format!("{} sample IDs", n_samples),
                got: format!("{} sample IDs", sample_ids.len()),
            });
        }

        if counts.iter().any(|&x| x < 0.0 || !x.is_finite()) {
            return Err(ShrinkError::InvalidCountMatrix {
                reason: "Counts must be non-negative finite values".to_string(),
            });
        }

        if counts.iter().any(|&x| x != x.round()) {
            log::warn!("Some count values are not integers; the negative binomial model expects integer counts");
        }

        Ok(Self {
            counts,
            gene_ids: deduplicate_names(gene_ids),
            sample_ids,
        })
    }

    pub fn n_genes(&self) -> usize {
        self.counts.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.counts.ncols()
    }

    /// Raw counts as a view
    pub fn counts(&self) -> ArrayView2<'_, f64> {
        self.counts.view()
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn gene_index(&self, gene_id: &str) -> Option<usize> {
        self.gene_ids.iter().position(|id| id == gene_id)
    }

    /// Genes whose counts are zero in every sample
    pub fn all_zero_genes(&self) -> Vec<bool> {
        self.counts
            .axis_iter(Axis(0))
            .map(|row| row.iter().all(|&x| x == 0.0))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_count_matrix_creation() {
        let counts = array![[10.0, 20.0, 30.0], [5.0, 15.0, 25.0]];
        let gene_ids = vec!["gene1".to_string(), "gene2".to_string()];
        let sample_ids = vec!["s1".to_string(), "s2".to_string(), "s3".to_string()];

        let matrix = CountMatrix::new(counts, gene_ids, sample_ids).unwrap();
        assert_eq!(matrix.n_genes(), 2);
        assert_eq!(matrix.n_samples(), 3);
        assert_eq!(matrix.gene_index("gene2"), Some(1));
    }

    #[test]
    fn test_negative_counts_rejected() {
        let counts = array![[10.0, -5.0], [5.0, 15.0]];
        let gene_ids = vec!["gene1".to_string(), "gene2".to_string()];
        let sample_ids = vec!["s1".to_string(), "s2".to_string()];

        let result = CountMatrix::new(counts, gene_ids, sample_ids);
        assert!(matches!(result, Err(ShrinkError::InvalidCountMatrix { .. })));
    }

    #[test]
    fn test_duplicate_ids_renamed() {
        let counts = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let gene_ids = vec!["g".to_string(), "h".to_string(), "g".to_string()];
        let sample_ids = vec!["s1".to_string(), "s2".to_string()];

        let matrix = CountMatrix::new(counts, gene_ids, sample_ids).unwrap();
        assert_eq!(matrix.gene_ids(), &["g", "h", "g_1"]);
    }

    #[test]
    fn test_all_zero_genes() {
        let counts = array![[0.0, 0.0], [3.0, 0.0]];
        let matrix = CountMatrix::new(
            counts,
            vec!["a".to_string(), "b".to_string()],
            vec!["s1".to_string(), "s2".to_string()],
        )
        .unwrap();
        assert_eq!(matrix.all_zero_genes(), vec![true, false]);
    }
}
