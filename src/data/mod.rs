//! Data structures for a fitted count model

pub mod builder;
mod count_matrix;
mod metadata;
mod model;

pub use builder::FittedModelBuilder;
pub use count_matrix::CountMatrix;
pub use metadata::SampleMetadata;
pub use model::{CoefficientColumn, CoefficientFit, DesignSpec, FitKind, FittedModel};
