//! Routing Eval CLI
//!
//! Runs skill-routing evaluations against CLI model backends and compares
//! results against stored baselines.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};

use routing_eval::baseline::{self, ComparisonMode};
use routing_eval::config::{BackendName, EvalConfig};
use routing_eval::dataset::{load_cases, DomainGroups};
use routing_eval::harness::{EvalHarness, RunOptions};
use routing_eval::CompareThresholds;

#[derive(Parser)]
#[command(name = "routing-eval", about = "Offline skill-routing evaluation harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the confusion-matrix evaluation.
    Run(RunArgs),
    /// Compare the latest results against a baseline or static expectations.
    Compare(CompareArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "eval.yaml")]
    config: PathBuf,

    /// Override the datasets directory.
    #[arg(long)]
    datasets: Option<PathBuf>,

    /// Override the declared groups file.
    #[arg(long)]
    groups: Option<PathBuf>,

    /// Evaluate a single domain group.
    #[arg(long)]
    group: Option<String>,

    /// Override the CLI backend (claude, codex, copilot).
    #[arg(long)]
    backend: Option<String>,

    /// Override the generation model.
    #[arg(long)]
    model: Option<String>,

    /// Override the judge model used for fallback detection.
    #[arg(long)]
    judge_model: Option<String>,

    /// Number of evaluation runs over the dataset.
    #[arg(long, default_value_t = 1)]
    runs: u32,

    /// RNG seed recorded in run metadata.
    #[arg(long)]
    seed: Option<u64>,

    /// Override the output directory for results.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Show dataset contents and exit without any backend calls.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum CompareModeArg {
    AgainstBaseline,
    StaticExpectation,
}

#[derive(clap::Args)]
struct CompareArgs {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "eval.yaml")]
    config: PathBuf,

    /// Comparison mode; never inferred from file presence.
    #[arg(long, value_enum)]
    mode: CompareModeArg,

    /// Eval type whose results are compared.
    #[arg(long, default_value = "confusion")]
    eval_type: String,

    /// Override the results directory.
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Override the baselines directory.
    #[arg(long)]
    baselines_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_eval(args).await,
        Commands::Compare(args) => run_compare(args),
    }
}

async fn run_eval(args: RunArgs) -> ExitCode {
    let mut config = match EvalConfig::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            return ExitCode::from(2);
        }
    };

    if let Some(backend) = args.backend {
        config.backend = BackendName(backend);
    }
    if let Some(model) = args.model {
        config.models.generation_model = model;
    }
    if let Some(judge_model) = args.judge_model {
        config.models.judge_model = judge_model;
    }
    if let Some(datasets) = args.datasets {
        config.paths.datasets_dir = datasets;
    }
    if let Some(groups) = args.groups {
        config.paths.groups_file = groups;
    }

    let groups = match DomainGroups::load(&config.paths.groups_file) {
        Ok(groups) => groups,
        Err(e) => {
            eprintln!(
                "Failed to load groups from {}: {}",
                config.paths.groups_file.display(),
                e
            );
            return ExitCode::from(2);
        }
    };

    if let Some(group) = &args.group {
        if !groups.contains(group) {
            eprintln!(
                "Unknown group '{}'. Valid groups: {}",
                group,
                groups.group_names().join(", ")
            );
            return ExitCode::from(2);
        }
    }

    let loaded = match load_cases(&config.paths.datasets_dir, args.group.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Failed to load datasets: {}", e);
            return ExitCode::from(2);
        }
    };

    if args.dry_run {
        let mut per_group: std::collections::BTreeMap<&str, usize> = Default::default();
        for case in &loaded.confusion {
            *per_group.entry(case.group.as_deref().unwrap_or("unknown")).or_default() += 1;
        }
        eprintln!(
            "Dry run -- {} group(s), {} confusion case(s), {} negative control(s)",
            per_group.len(),
            loaded.confusion.len(),
            loaded.negative.len()
        );
        for (group, count) in &per_group {
            let (_, skill_count) = groups.build_group_index(group);
            eprintln!("  group: {} -- {} cases, {} skills in index", group, count, skill_count);
        }
        eprintln!("Dry run complete. No backend calls made.");
        println!("TOTAL_CALLS=0");
        println!("COST_USD=0.0");
        println!("ABORTED=0");
        println!("FAIL_FAST=0");
        println!("N_CASES={}", loaded.confusion.len() + loaded.negative.len());
        return ExitCode::SUCCESS;
    }

    let seed = args.seed.unwrap_or(config.rng.default_seed);
    let options = RunOptions {
        eval_type: "confusion".to_string(),
        runs: args.runs.max(1),
        seed,
        output_dir: args.output_dir,
    };

    let mut harness = match EvalHarness::connect(config, groups).await {
        Ok(harness) => harness,
        Err(e) => {
            eprintln!("Failed to initialize harness: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match harness.run(&loaded.confusion, &loaded.negative, &options).await {
        Ok(outcome) => {
            eprintln!("Results written to: {}", outcome.output_path.display());
            // Runner output contract, consumed by CI wrappers.
            println!("TOTAL_CALLS={}", outcome.total_calls);
            println!("COST_USD={:.4}", outcome.total_cost);
            println!("ABORTED={}", if outcome.aborted { 1 } else { 0 });
            println!("FAIL_FAST={}", if outcome.fail_fast { 1 } else { 0 });
            if let Some(reason) = &outcome.envelope.meta.fail_fast_reason {
                println!("FAIL_FAST_REASON={}", reason);
            }
            println!("N_CASES={}", outcome.envelope.cases.len());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Eval run failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_compare(args: CompareArgs) -> ExitCode {
    let config = match EvalConfig::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            return ExitCode::from(2);
        }
    };

    let results_dir = args.results_dir.unwrap_or(config.paths.results_dir);
    let baselines_dir = args.baselines_dir.unwrap_or(config.paths.baselines_dir);

    let current = match baseline::load_latest_result(&results_dir, &args.eval_type) {
        Ok(Some(envelope)) => envelope,
        Ok(None) => {
            eprintln!(
                "No {} results found under {}",
                args.eval_type,
                results_dir.display()
            );
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("Failed to load results: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mode = match args.mode {
        CompareModeArg::AgainstBaseline => ComparisonMode::AgainstBaseline,
        CompareModeArg::StaticExpectation => ComparisonMode::StaticExpectation,
    };

    let stored = match baseline::load_baseline(&baselines_dir, &args.eval_type) {
        Ok(stored) => stored,
        Err(e) => {
            eprintln!("Failed to load baseline: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match baseline::compare(&current, stored.as_ref(), mode, &CompareThresholds::default()) {
        Ok(findings) if findings.is_empty() => {
            println!("No regressions detected for run {}", current.meta.run_id);
            ExitCode::SUCCESS
        }
        Ok(findings) => {
            println!(
                "{} finding(s) for run {}:",
                findings.len(),
                current.meta.run_id
            );
            for finding in findings {
                println!("  {}", finding);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Comparison failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
