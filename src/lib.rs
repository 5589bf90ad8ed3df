//! rust_lfcshrink: empirical-Bayes shrinkage of log2 fold changes
//!
//! Given a negative binomial GLM fit (counts, design, dispersions and MLE
//! coefficients), shrink the effect of one coefficient or contrast toward
//! zero with one of three estimators: a normal prior with a ridge refit
//! (DESeq2 "normal"), a Cauchy prior (apeglm) or a normal mixture (ashr).
//!
//! # Example
//!
//! ```ignore
//! use rust_lfcshrink::prelude::*;
//!
//! let model = ModelBundle::from_path("model.json")?.into_model()?;
//!
//! let options = ShrinkOptions {
//!     coefficient: Some(CoefficientRef::Name("condition_B_vs_A".to_string())),
//!     estimator: EstimatorType::ExternalParametric,
//!     use_svalues: true,
//!     ..Default::default()
//! };
//! let output = lfc_shrink(&model, None, &options, &ShrinkServices::builtin())?;
//! write_results("shrunken.tsv", &output.table)?;
//! ```

pub mod cli;
pub mod data;
pub mod error;
pub mod glm;
pub mod io;
pub mod shrinkage;
pub mod stats;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::data::{CountMatrix, FittedModel, FittedModelBuilder, SampleMetadata};
    pub use crate::error::{Result, ShrinkError};
    pub use crate::glm::{fit_mle, DesignFormula, DesignInfo, IrlsRidgeFitter, ModelMatrixType, RidgeFitter};
    pub use crate::io::{read_results, write_results, ColumnKind, ModelBundle, ResultsTable};
    pub use crate::shrinkage::{
        lfc_shrink, CoefficientRef, Contrast, ConvergenceWarning, EstimatorType, PriorDiagnostics, PriorInfo,
        RawFit, ShrinkOptions, ShrinkOutput, ShrinkServices, WorkerPool,
    };
    pub use crate::testing::{ResultsProvider, WaldResultsProvider};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use ndarray::{array, Array1};

    #[test]
    fn test_full_pipeline() {
        let counts = CountMatrix::new(
            array![
                [100.0, 110.0, 90.0, 400.0, 420.0, 380.0],
                [500.0, 520.0, 480.0, 500.0, 510.0, 490.0],
                [300.0, 310.0, 290.0, 75.0, 80.0, 70.0],
                [50.0, 55.0, 45.0, 50.0, 52.0, 48.0],
                [200.0, 220.0, 180.0, 200.0, 210.0, 190.0],
                [150.0, 160.0, 140.0, 300.0, 320.0, 280.0],
                [400.0, 420.0, 380.0, 100.0, 110.0, 90.0],
                [80.0, 85.0, 75.0, 80.0, 82.0, 78.0],
                [600.0, 620.0, 580.0, 600.0, 610.0, 590.0],
                [250.0, 260.0, 240.0, 500.0, 520.0, 480.0],
            ],
            vec![
                "gene_up".to_string(),
                "gene_nc1".to_string(),
                "gene_down".to_string(),
                "gene_nc2".to_string(),
                "gene_nc3".to_string(),
                "gene_up2".to_string(),
                "gene_down2".to_string(),
                "gene_nc4".to_string(),
                "gene_nc5".to_string(),
                "gene_up3".to_string(),
            ],
            (1..=6).map(|i| format!("s{}", i)).collect(),
        )
        .unwrap();

        let mut metadata = SampleMetadata::new((1..=6).map(|i| format!("s{}", i)).collect());
        metadata
            .add_condition(
                "treatment",
                ["control", "control", "control", "treated", "treated", "treated"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            )
            .unwrap();

        let model = FittedModel::builder()
            .counts(counts)
            .metadata(metadata)
            .main_effect("treatment")
            .size_factors(Array1::from_elem(6, 1.0))
            .dispersions(Array1::from_elem(10, 0.02))
            .build()
            .unwrap();
        let model = fit_mle(&model, &IrlsRidgeFitter::default()).unwrap();
        assert_eq!(model.coefficient_names()[1], "treatment_treated_vs_control");

        let options = ShrinkOptions {
            coefficient: Some(CoefficientRef::Index(2)),
            ..Default::default()
        };
        let output = lfc_shrink(&model, None, &options, &ShrinkServices::builtin()).unwrap();
        let lfc = output.table.values(ColumnKind::EffectSize).unwrap();

        assert_eq!(lfc.len(), 10);
        assert!(lfc[0] > 1.0, "gene_up should stay up-regulated");
        assert!(lfc[2] < -1.0, "gene_down should stay down-regulated");
        assert!(lfc[1].abs() < 0.2);
        assert_eq!(
            output.table.prior_info().map(|p| p.estimator_type),
            Some(EstimatorType::Normal)
        );
    }
}
