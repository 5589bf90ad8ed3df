//! Generalized Linear Model fitting for negative binomial data

mod design;
mod fitting;
mod negative_binomial;

pub use design::{build_design_matrix, check_full_rank, DesignFormula, DesignInfo, FactorTerm, ModelMatrixType};
pub(crate) use fitting::two_loop_direction;
pub use fitting::{fit_mle, GlmFitParams, IrlsRidgeFitter, RidgeFit, RidgeFitInput, RidgeFitter, WIDE_PRIOR_LAMBDA};
pub use negative_binomial::{nb_mean, nb_weight, MAX_LFC_BETA, MIN_MU};
