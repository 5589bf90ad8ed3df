//! rust_lfcshrink command-line interface

use clap::Parser;
use log::{info, warn, LevelFilter};
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;

use rust_lfcshrink::cli::{describe_backend_args, Cli, Commands, ShrinkArgs};
use rust_lfcshrink::prelude::*;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `--fit-detail` output
#[derive(Serialize)]
struct FitDetail<'a> {
    prior_info: Option<&'a PriorInfo>,
    fit: &'a RawFit,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    // Find the first non-flag argument (potential subcommand)
    let first_positional = args.iter().skip(1).find(|a| !a.starts_with('-'));
    let subcommands = ["names", "shrink", "help"];
    let has_subcommand = first_positional.map_or(false, |a| subcommands.contains(&a.as_str()));

    if !has_subcommand {
        if args.len() == 1 {
            print_no_args();
            return;
        }
        if args.iter().any(|a| a == "--help") {
            print_long_help();
            return;
        }
        if args.iter().any(|a| a == "-h") {
            print_short_help();
            return;
        }
        if args.iter().any(|a| a == "-V" || a == "--version") {
            println!("rust_lfcshrink {}", VERSION);
            return;
        }
        print_no_args();
        return;
    }

    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    let result = match cli.command {
        Some(Commands::Names { model }) => run_names(&model),
        Some(Commands::Shrink(args)) => run_shrink(&args),
        None => {
            print_no_args();
            return;
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Custom help output
// ---------------------------------------------------------------------------

fn print_no_args() {
    println!("rust_lfcshrink v{}", VERSION);
    println!("Run `rust_lfcshrink -h` for usage or `rust_lfcshrink --help` for detailed information.");
}

fn print_short_help() {
    println!("rust_lfcshrink v{}", VERSION);
    println!();
    println!("Usage: rust_lfcshrink <COMMAND> [OPTIONS]");
    println!();
    println!("Commands:");
    println!("  names   List the coefficients of a fitted model");
    println!("  shrink  Shrink log2 fold changes");
    println!();
    println!("Run `rust_lfcshrink <COMMAND> -h` for command-specific options.");
}

fn print_long_help() {
    println!("rust_lfcshrink v{}", VERSION);
    println!("Empirical-Bayes log2 fold change shrinkage for negative binomial GLM fits");
    println!();
    println!("Usage: rust_lfcshrink <COMMAND> [OPTIONS]");
    println!();
    println!("Commands:");
    println!("  names   List the coefficients of a fitted model");
    println!("  shrink  Shrink log2 fold changes");
    println!("            - normal: normal prior, ridge refit (coefficient or contrast)");
    println!("            - apeglm: Cauchy prior, per-feature MAP, s-values");
    println!("            - ashr:   normal mixture prior, s-values");
    println!("            - optional partitioned execution on a worker pool");
    println!();
    println!("Global Options:");
    println!("  -v, --verbose    Enable verbose output");
    println!("  -h               Print short help");
    println!("      --help       Print detailed help");
    println!("  -V, --version    Print version");
    println!();
    println!("Examples:");
    println!("  rust_lfcshrink names -m model.json");
    println!();
    println!("  rust_lfcshrink shrink -m model.json --coef 2 -o shrunken.tsv");
    println!();
    println!("  rust_lfcshrink shrink -m model.json --coef condition_B_vs_A \\");
    println!("    --type apeglm --svalue --parallel --threads 4");
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn load_model(path: &str) -> Result<FittedModel> {
    info!("Loading model bundle from: {}", path);
    let model = ModelBundle::from_path(path)?.into_model()?;
    info!("  {} features, {} samples", model.n_features(), model.n_samples());
    Ok(model)
}

fn run_names(model_path: &str) -> Result<()> {
    let model = load_model(model_path)?;
    for (i, name) in model.coefficient_names().iter().enumerate() {
        println!("{}\t{}", i + 1, name);
    }
    Ok(())
}

fn run_shrink(args: &ShrinkArgs) -> Result<()> {
    let options = args.to_options()?;
    let mut model = load_model(&args.model)?;

    if model.fit().is_none() {
        if model.dispersions().is_some() {
            info!("Model bundle carries no MLE fit; fitting the GLM...");
            model = fit_mle(&model, &IrlsRidgeFitter::default())?;
        } else {
            warn!("Model bundle carries neither an MLE fit nor dispersions");
        }
    }

    let results = match &args.results {
        Some(path) => {
            info!("Loading results from: {}", path);
            Some(read_results(path)?)
        }
        None => None,
    };

    let mut services = ShrinkServices::builtin();
    if options.parallel {
        let threads = if args.threads > 0 {
            args.threads
        } else {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        };
        info!("Using {} worker threads", threads);
        services = services.with_pool(WorkerPool::new(threads)?);
    }
    if !options.backend_args.is_empty() {
        info!("Backend arguments: {}", describe_backend_args(&options.backend_args));
    }

    let output = lfc_shrink(&model, results.as_ref(), &options, &services)?;

    info!("Writing shrunken results to: {}", args.output);
    write_results(&args.output, &output.table)?;

    if let (Some(path), Some(fit)) = (&args.fit_detail, &output.fit) {
        info!("Writing fit detail to: {}", path);
        let detail = FitDetail {
            prior_info: output.table.prior_info(),
            fit,
        };
        serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), &detail)?;
    }

    if let Some(prior) = output.table.prior_info() {
        match &prior.diagnostics {
            PriorDiagnostics::Normal { prior_variance, .. } => {
                info!("Prior variance: {:.6}", prior_variance)
            }
            PriorDiagnostics::Parametric { prior_control, .. } => {
                info!("Prior scale: {:.6}", prior_control.prior_scale)
            }
            PriorDiagnostics::Nonparametric { mixture, .. } => {
                info!("Mixture with {} components", mixture.sd.len())
            }
        }
    }
    if !output.warnings.is_empty() {
        warn!("{} convergence warning(s); see above", output.warnings.len());
    }
    info!("Done! Shrinkage complete.");
    Ok(())
}
