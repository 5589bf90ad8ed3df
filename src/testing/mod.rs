//! Base results for shrinkage: Wald statistics and BH adjustment

mod fdr;
mod pvalue;
mod wald;

pub use fdr::benjamini_hochberg;
pub use pvalue::calculate_pvalue;
pub use wald::WaldResultsProvider;

use crate::data::FittedModel;
use crate::error::Result;
use crate::io::ResultsTable;
use crate::shrinkage::ShrinkTarget;

/// Produces the unshrunken results table for a coefficient or contrast.
/// R equivalent: results(dds, name=..., contrast=...)
pub trait ResultsProvider: Send + Sync {
    fn results(&self, model: &FittedModel, target: &ShrinkTarget) -> Result<ResultsTable>;
}
