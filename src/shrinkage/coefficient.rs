//! Coefficient and contrast resolution against a fitted model's coefficient list

use serde::{Deserialize, Serialize};

use crate::data::FittedModel;
use crate::error::{Result, ShrinkError};
use crate::glm::DesignInfo;

/// A single coefficient, by 1-based position or exact name.
/// R equivalent: the `coef` argument of lfcShrink()
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoefficientRef {
    Index(usize),
    Name(String),
}

impl CoefficientRef {
    /// Parse a CLI-style reference: digits are a position, anything else a name
    pub fn parse(s: &str) -> CoefficientRef {
        match s.trim().parse::<usize>() {
            Ok(i) => CoefficientRef::Index(i),
            Err(_) => CoefficientRef::Name(s.trim().to_string()),
        }
    }
}

fn default_list_values() -> (f64, f64) {
    (1.0, -1.0)
}

/// A linear combination of coefficients.
/// R equivalent: the `contrast` argument of results()/lfcShrink()
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Contrast {
    /// One weight per coefficient
    Numeric(Vec<f64>),
    /// c("factor", "numerator", "denominator")
    Levels {
        factor: String,
        numerator: String,
        denominator: String,
    },
    /// list(numerator, denominator) with listValues
    List {
        numerator: Vec<String>,
        #[serde(default)]
        denominator: Vec<String>,
        #[serde(default = "default_list_values")]
        values: (f64, f64),
    },
}

/// Canonical coefficient identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedCoefficient {
    pub name: String,
    /// 0-based column of the design
    pub index: usize,
}

impl ResolvedCoefficient {
    /// 1-based position, as accepted by [`CoefficientRef::Index`]
    pub fn position(&self) -> usize {
        self.index + 1
    }
}

/// A contrast reduced to a weight vector over the design columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedContrast {
    pub weights: Vec<f64>,
    pub label: String,
    pub contrast: Contrast,
}

/// What a shrinkage call operates on
#[derive(Debug, Clone, PartialEq)]
pub enum ShrinkTarget {
    Coefficient(ResolvedCoefficient),
    Contrast(ResolvedContrast),
    /// Neither given; the caller's results table defines the effect
    Results,
}

impl ShrinkTarget {
    pub fn is_contrast(&self) -> bool {
        matches!(self, ShrinkTarget::Contrast(_))
    }
}

/// Resolve a coefficient reference against an ordered coefficient list
pub fn resolve_coefficient(names: &[String], coef: &CoefficientRef) -> Result<ResolvedCoefficient> {
    match coef {
        CoefficientRef::Index(i) => {
            if *i == 0 || *i > names.len() {
                return Err(ShrinkError::InvalidCoefficient {
                    reason: format!("index {} is out of range 1..={}", i, names.len()),
                });
            }
            Ok(ResolvedCoefficient {
                name: names[i - 1].clone(),
                index: i - 1,
            })
        }
        CoefficientRef::Name(name) => names
            .iter()
            .position(|n| n == name)
            .map(|index| ResolvedCoefficient {
                name: name.clone(),
                index,
            })
            .ok_or_else(|| ShrinkError::InvalidCoefficient {
                reason: format!("'{}' is not a coefficient. Available: {:?}", name, names),
            }),
    }
}

fn column_named(info: &DesignInfo, name: &str) -> Result<usize> {
    info.coef_names
        .iter()
        .position(|n| n == name)
        .ok_or_else(|| ShrinkError::InvalidContrast {
            reason: format!("coefficient '{}' not found. Available: {:?}", name, info.coef_names),
        })
}

/// Reduce a contrast to weights over the columns of `info`
pub fn resolve_contrast(info: &DesignInfo, contrast: &Contrast) -> Result<ResolvedContrast> {
    let n_coefs = info.n_coefs();
    let mut weights = vec![0.0; n_coefs];

    let label = match contrast {
        Contrast::Numeric(w) => {
            if w.len() != n_coefs {
                return Err(ShrinkError::InvalidContrast {
                    reason: format!(
                        "numeric contrast has {} elements but the model has {} coefficients",
                        w.len(),
                        n_coefs
                    ),
                });
            }
            if w.iter().any(|x| !x.is_finite()) {
                return Err(ShrinkError::InvalidContrast {
                    reason: "numeric contrast must be finite".to_string(),
                });
            }
            if w.iter().all(|&x| x == 0.0) {
                return Err(ShrinkError::InvalidContrast {
                    reason: "numeric contrast is all zero".to_string(),
                });
            }
            weights.copy_from_slice(w);
            w.iter().map(|x| format!("{}", x)).collect::<Vec<_>>().join(",")
        }
        Contrast::Levels {
            factor,
            numerator,
            denominator,
        } => {
            let term = info.factor(factor).ok_or_else(|| ShrinkError::InvalidContrast {
                reason: format!("'{}' is not a factor of the design", factor),
            })?;
            for level in [numerator, denominator] {
                if !term.has_level(level) {
                    return Err(ShrinkError::InvalidContrast {
                        reason: format!(
                            "'{}' is not a level of '{}'. Available: {:?}",
                            level, factor, term.levels
                        ),
                    });
                }
            }
            if numerator == denominator {
                return Err(ShrinkError::InvalidContrast {
                    reason: format!("numerator and denominator are both '{}'", numerator),
                });
            }
            // Reference level has no column in a standard design
            if let Some(col) = term.column_for(numerator) {
                weights[col] += 1.0;
            }
            if let Some(col) = term.column_for(denominator) {
                weights[col] -= 1.0;
            }
            format!("{} {} vs {}", factor, numerator, denominator)
        }
        Contrast::List {
            numerator,
            denominator,
            values,
        } => {
            if numerator.is_empty() && denominator.is_empty() {
                return Err(ShrinkError::InvalidContrast {
                    reason: "list contrast names no coefficients".to_string(),
                });
            }
            if let Some(both) = numerator.iter().find(|n| denominator.contains(n)) {
                return Err(ShrinkError::InvalidContrast {
                    reason: format!("'{}' appears in both numerator and denominator", both),
                });
            }
            for name in numerator {
                weights[column_named(info, name)?] += values.0;
            }
            for name in denominator {
                weights[column_named(info, name)?] += values.1;
            }
            if denominator.is_empty() {
                numerator.join("+")
            } else {
                format!("{} vs {}", numerator.join("+"), denominator.join("+"))
            }
        }
    };

    Ok(ResolvedContrast {
        weights,
        label,
        contrast: contrast.clone(),
    })
}

/// Decide what a call shrinks. Coefficient and contrast are mutually exclusive;
/// with neither, a caller-supplied results table must be present.
pub fn resolve_target(
    model: &FittedModel,
    coefficient: Option<&CoefficientRef>,
    contrast: Option<&Contrast>,
    has_results: bool,
) -> Result<ShrinkTarget> {
    match (coefficient, contrast) {
        (Some(_), Some(_)) => Err(ShrinkError::ConflictingSpec {
            reason: "supply either a coefficient or a contrast, not both".to_string(),
        }),
        (Some(coef), None) => Ok(ShrinkTarget::Coefficient(resolve_coefficient(
            model.coefficient_names(),
            coef,
        )?)),
        (None, Some(contrast)) => Ok(ShrinkTarget::Contrast(resolve_contrast(model.design_info(), contrast)?)),
        (None, None) if has_results => Ok(ShrinkTarget::Results),
        (None, None) => Err(ShrinkError::MissingSpec {
            reason: "a coefficient or a contrast is required when no results are supplied".to_string(),
        }),
    }
}
