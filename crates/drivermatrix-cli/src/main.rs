//! drivermatrix - build-matrix release and verification pipeline CLI
//!
//! ## Commands
//!
//! - `run`: resolve a schedule, build, package and test every variant
//! - `resolve`: print the variants and tiers a schedule would run
//! - `schedules`: list the schedules a configuration declares
//! - `report`: render a saved `pipeline_report.json` as a table
//!
//! Exit codes: 0 when the run completed (tier failures are in the report),
//! 1 when `--strict` is set and the run was flagged, 2 on a configuration
//! error, 3 on any other orchestrator failure.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, Level};

use drivermatrix_ci::{
    init_tracing, ConfigurationError, MatrixPipeline, PipelineConfig, RunPlan, RunReport, VariantProfile,
    FULL_SCHEDULE, REPORT_FILE,
};

const EXIT_FLAGGED: u8 = 1;
const EXIT_CONFIGURATION: u8 = 2;
const EXIT_INTERNAL: u8 = 3;

#[derive(Parser)]
#[command(name = "drivermatrix")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build-matrix release and verification pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every variant of a schedule and write the aggregated report
    Run {
        /// Matrix configuration file (TOML)
        #[arg(short, long, env = "DRIVERMATRIX_CONFIG")]
        config: PathBuf,

        /// Schedule to run
        #[arg(short, long, default_value = FULL_SCHEDULE)]
        schedule: String,

        /// Output directory (default: pipeline.output_dir)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Override the number of variants run at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Exit non-zero when the run is flagged
        #[arg(long)]
        strict: bool,
    },

    /// Print the resolved matrix for a schedule without running it
    Resolve {
        /// Matrix configuration file (TOML)
        #[arg(short, long, env = "DRIVERMATRIX_CONFIG")]
        config: PathBuf,

        /// Schedule to resolve
        #[arg(short, long, default_value = FULL_SCHEDULE)]
        schedule: String,
    },

    /// List the schedules a configuration declares
    Schedules {
        /// Matrix configuration file (TOML)
        #[arg(short, long, env = "DRIVERMATRIX_CONFIG")]
        config: PathBuf,
    },

    /// Render a saved report
    Report {
        /// Report file, or the output directory containing it
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    let result = match cli.command {
        Commands::Run {
            config,
            schedule,
            output,
            concurrency,
            strict,
        } => cmd_run(&config, &schedule, output, concurrency, strict, cli.json).await,
        Commands::Resolve { config, schedule } => cmd_resolve(&config, &schedule, cli.json),
        Commands::Schedules { config } => cmd_schedules(&config),
        Commands::Report { path } => cmd_report(&path, cli.json),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "drivermatrix failed");
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

/// Configuration problems are reported distinctly from everything else.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.chain().any(|cause| cause.is::<ConfigurationError>()) {
        EXIT_CONFIGURATION
    } else {
        EXIT_INTERNAL
    }
}

fn load_plan(config_path: &Path, schedule: &str) -> Result<(PipelineConfig, RunPlan)> {
    let config = PipelineConfig::from_path(config_path)?;
    let plan = config
        .plan(schedule)
        .with_context(|| format!("Failed to resolve schedule `{}`", schedule))?;
    Ok((config, plan))
}

async fn cmd_run(
    config_path: &Path,
    schedule: &str,
    output: Option<PathBuf>,
    concurrency: Option<usize>,
    strict: bool,
    json: bool,
) -> Result<ExitCode> {
    let (config, mut plan) = load_plan(config_path, schedule)?;
    if let Some(limit) = concurrency {
        if limit == 0 {
            return Err(ConfigurationError::Invalid("--concurrency must be at least 1".to_string()).into());
        }
        plan.concurrency = limit;
    }
    let output = output.unwrap_or_else(|| config.pipeline.output_dir.clone());

    let pipeline = MatrixPipeline::from_config(&config, &output);
    info!(
        run_id = %pipeline.run_id(),
        config = %config_path.display(),
        output = %output.display(),
        "Run starting"
    );
    let report = pipeline.run(&plan).await.context("Matrix run failed")?;

    let report_path = output.join(REPORT_FILE);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_table());
        for violation in &report.verdict.violations {
            println!("  - {}", violation);
        }
        println!("Report: {}", report_path.display());
    }

    if strict && report.flagged {
        return Ok(ExitCode::from(EXIT_FLAGGED));
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Debug, Serialize)]
struct ResolvedVariant<'a> {
    id: String,
    signature: String,
    profile: &'a VariantProfile,
}

#[derive(Debug, Serialize)]
struct ResolvedPlan<'a> {
    schedule: &'a str,
    concurrency: usize,
    tiers: Vec<&'static str>,
    variants: Vec<ResolvedVariant<'a>>,
}

fn resolved(plan: &RunPlan) -> ResolvedPlan<'_> {
    ResolvedPlan {
        schedule: &plan.schedule,
        concurrency: plan.concurrency,
        tiers: plan.tiers.iter().map(|t| t.kind.name()).collect(),
        variants: plan
            .variants
            .iter()
            .map(|(variant, profile)| ResolvedVariant {
                id: variant.id(),
                signature: variant.signature(),
                profile,
            })
            .collect(),
    }
}

fn cmd_resolve(config_path: &Path, schedule: &str, json: bool) -> Result<ExitCode> {
    let (_, plan) = load_plan(config_path, schedule)?;
    let view = resolved(&plan);

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("Schedule: {}", view.schedule);
    println!("Tiers: {}", view.tiers.join(", "));
    println!("Concurrency: {}", view.concurrency);
    println!();
    for variant in &view.variants {
        println!("  {}  {}", variant.id, variant.signature);
    }
    println!();
    println!("{} variant(s)", view.variants.len());
    Ok(ExitCode::SUCCESS)
}

fn cmd_schedules(config_path: &Path) -> Result<ExitCode> {
    let config = PipelineConfig::from_path(config_path)?;
    for name in config.schedule_names() {
        println!("{}", name);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_report(path: &Path, json: bool) -> Result<ExitCode> {
    let file = if path.is_dir() {
        path.join(REPORT_FILE)
    } else {
        path.to_path_buf()
    };
    let report =
        RunReport::read_json(&file).with_context(|| format!("Failed to read report: {}", file.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report.verdict)?);
    } else {
        println!("Run ID: {}", report.run.run_id());
        println!("Schedule: {}", report.run.schedule());
        println!("Duration: {}ms", report.run.duration_ms());
        println!();
        print!("{}", report.render_table());
    }
    Ok(ExitCode::SUCCESS)
}
