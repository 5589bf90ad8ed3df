//! Command-line interface for rust_lfcshrink

use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::io::BufReader;

use crate::error::{Result, ShrinkError};
use crate::shrinkage::{BackendArgs, CoefficientRef, Contrast, EstimatorType, ShrinkOptions};

#[derive(Parser)]
#[command(name = "rust_lfcshrink")]
#[command(version)]
#[command(about = "Log fold change shrinkage for negative binomial GLM fits")]
#[command(disable_help_flag = true)]
#[command(disable_version_flag = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the coefficients of a fitted model
    #[command(
        long_about = "List the coefficients of a fitted model bundle.\n\n\
            Prints one coefficient per line with its 1-based index, the form\n\
            accepted by `shrink --coef`.",
        after_long_help = "\
Examples:
  rust_lfcshrink names -m model.json"
    )]
    Names {
        /// Path to the JSON model bundle
        #[arg(short, long)]
        model: String,
    },

    /// Shrink log2 fold changes
    #[command(
        long_about = "Shrink the log2 fold changes of one coefficient or contrast.\n\n\
            Estimates a prior on the effect sizes from all features and returns\n\
            posterior (normal, apeglm) or posterior-mean (ashr) log2 fold changes.",
        after_long_help = "\
Examples:
  # Normal prior on the second coefficient
  rust_lfcshrink shrink -m model.json --coef 2 -o shrunken.tsv

  # apeglm with s-values, four worker threads
  rust_lfcshrink shrink -m model.json --coef condition_B_vs_A \\
    --type apeglm --svalue --parallel --threads 4

  # ashr on a contrast between two non-reference levels
  rust_lfcshrink shrink -m model.json --contrast condition,C,B --type ashr

  # ashr on a results table produced elsewhere
  rust_lfcshrink shrink -m model.json -r results.tsv --type ashr"
    )]
    Shrink(ShrinkArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct ShrinkArgs {
    /// Path to the JSON model bundle
    #[arg(short, long)]
    pub model: String,

    /// Unshrunken results table (TSV)
    #[arg(short, long,
        long_help = "Unshrunken results table (TSV) to shrink.\n\
            Rows must be the model's features in the same order.\n\
            Without it, Wald results are computed from the model's MLE fit.")]
    pub results: Option<String>,

    /// Coefficient name or 1-based index
    #[arg(short, long)]
    pub coef: Option<String>,

    /// Level contrast (format: factor,numerator,denominator)
    #[arg(long, value_name = "FACTOR,NUM,DEN")]
    pub contrast: Option<String>,

    /// Numeric contrast, one weight per coefficient
    #[arg(long, value_name = "W1,W2,...", conflicts_with = "contrast")]
    pub contrast_vector: Option<String>,

    /// Shrinkage estimator [default: normal]
    #[arg(long = "type", value_name = "TYPE",
        long_help = "Shrinkage estimator.\n\
            normal: Normal prior with ridge refit (coefficient or contrast)\n\
            apeglm: Cauchy prior, per-feature MAP (coefficient only)\n\
            ashr:   Normal mixture prior fit by EM")]
    pub estimator: Option<String>,

    /// Replace p-values with s-values (apeglm, ashr)
    #[arg(long)]
    pub svalue: bool,

    /// Do not adapt the apeglm prior from the MLE
    #[arg(long)]
    pub no_adapt: bool,

    /// apeglm method: nbinomCR or nbinomC
    #[arg(long)]
    pub method: Option<String>,

    /// Fit partitions of features on a worker pool
    #[arg(long)]
    pub parallel: bool,

    /// Worker threads (0 = all cores) [default: 0]
    #[arg(short = 't', long, default_value = "0")]
    pub threads: usize,

    /// Partitions per worker
    #[arg(long)]
    pub chunk_multiplier: Option<usize>,

    /// Upper quantile for the normal prior variance
    #[arg(long)]
    pub upper_quantile: Option<f64>,

    /// Backend argument (format: key=value), repeatable
    #[arg(long = "arg", value_name = "KEY=VALUE")]
    pub backend_args: Vec<String>,

    /// JSON options file; explicit flags take precedence
    #[arg(long)]
    pub options: Option<String>,

    /// Write the raw backend fit as JSON
    #[arg(long, value_name = "PATH")]
    pub fit_detail: Option<String>,

    /// Output file path [default: shrunken_results.tsv]
    #[arg(short, long, default_value = "shrunken_results.tsv")]
    pub output: String,
}

impl ShrinkArgs {
    /// Options file (if any) overlaid with the command-line flags
    pub fn to_options(&self) -> Result<ShrinkOptions> {
        let mut options = match &self.options {
            Some(path) => {
                let reader = BufReader::new(File::open(path)?);
                serde_json::from_reader(reader)?
            }
            None => ShrinkOptions::default(),
        };

        if let Some(coef) = &self.coef {
            options.coefficient = Some(CoefficientRef::parse(coef));
        }
        if let Some(contrast) = &self.contrast {
            options.contrast = Some(parse_level_contrast(contrast)?);
        }
        if let Some(weights) = &self.contrast_vector {
            options.contrast = Some(parse_numeric_contrast(weights)?);
        }
        if let Some(estimator) = &self.estimator {
            options.estimator = estimator.parse::<EstimatorType>()?;
        }
        options.use_svalues |= self.svalue;
        if self.no_adapt {
            options.adapt_prior_from_mle = false;
        }
        if let Some(method) = &self.method {
            options.backend_method = Some(method.clone());
        }
        options.parallel |= self.parallel;
        if let Some(k) = self.chunk_multiplier {
            options.chunk_multiplier = k;
        }
        if let Some(q) = self.upper_quantile {
            options.upper_quantile = q;
        }
        options.return_fit_detail |= self.fit_detail.is_some();
        for arg in &self.backend_args {
            let (key, value) = parse_backend_arg(arg)?;
            options.backend_args.insert(key, value);
        }
        Ok(options)
    }
}

fn parse_level_contrast(s: &str) -> Result<Contrast> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [factor, numerator, denominator] if parts.iter().all(|p| !p.is_empty()) => Ok(Contrast::Levels {
            factor: factor.to_string(),
            numerator: numerator.to_string(),
            denominator: denominator.to_string(),
        }),
        _ => Err(ShrinkError::InvalidContrast {
            reason: format!("expected factor,numerator,denominator, got '{}'", s),
        }),
    }
}

fn parse_numeric_contrast(s: &str) -> Result<Contrast> {
    s.split(',')
        .map(|w| {
            w.trim().parse::<f64>().map_err(|_| ShrinkError::InvalidContrast {
                reason: format!("'{}' is not a number", w.trim()),
            })
        })
        .collect::<Result<Vec<f64>>>()
        .map(Contrast::Numeric)
}

/// `key=value`; the value is read as JSON when it parses, else as a string
fn parse_backend_arg(s: &str) -> Result<(String, serde_json::Value)> {
    let (key, value) = s.split_once('=').ok_or_else(|| ShrinkError::InvalidInput {
        reason: format!("backend argument '{}' is not key=value", s),
    })?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ShrinkError::InvalidInput {
            reason: format!("backend argument '{}' has an empty key", s),
        });
    }
    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| serde_json::Value::String(value.trim().to_string()));
    Ok((key.to_string(), value))
}

/// Options carried in a `BackendArgs` map, for display
pub fn describe_backend_args(args: &BackendArgs) -> String {
    args.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}
