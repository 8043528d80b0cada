//! Wheelhouse CLI
//!
//! The `wheelhouse` command drives the build-and-release matrix for one
//! trigger event.
//!
//! ## Commands
//!
//! - `plan`: Print the jobs an event would expand to
//! - `run`: Execute every job of an event and publish per event rules
//! - `check-config`: Validate a configuration file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

use wheelhouse_core::events::to_jsonl;
use wheelhouse_core::{
    telemetry, CancelHandle, EventContext, Job, Orchestrator, PipelineConfig, ProcessRunner,
    RunReport, TriggerEvent,
};

#[derive(Parser)]
#[command(name = "wheelhouse")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-platform wheel build and release orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline configuration file
    #[arg(short, long, global = true, default_value = "wheelhouse.toml", env = "WHEELHOUSE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the jobs an event expands to, as JSON
    Plan {
        /// Trigger event: pull_request, push or release
        #[arg(short, long)]
        event: TriggerEvent,

        /// Branch the event targets
        #[arg(short, long)]
        branch: Option<String>,

        /// Release tag
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// Run every job of an event
    Run {
        /// Trigger event: pull_request, push or release
        #[arg(short, long)]
        event: TriggerEvent,

        /// Branch the event targets
        #[arg(short, long)]
        branch: Option<String>,

        /// Release tag (required for release events)
        #[arg(short, long)]
        tag: Option<String>,

        /// Write the run's event log as JSON lines
        #[arg(long)]
        events_out: Option<PathBuf>,

        /// Print the full run report as JSON instead of a summary
        #[arg(long)]
        report_json: bool,
    },

    /// Validate the configuration file
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Plan { event, branch, tag } => cmd_plan(&cli.config, event, branch, tag),
        Commands::Run {
            event,
            branch,
            tag,
            events_out,
            report_json,
        } => {
            let code = cmd_run(
                &cli.config,
                event,
                branch,
                tag,
                events_out.as_deref(),
                report_json,
            )
            .await?;
            std::process::exit(code);
        }
        Commands::CheckConfig => cmd_check_config(&cli.config),
    }
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::load(path).with_context(|| format!("Failed to load config {:?}", path))
}

fn event_context(
    event: TriggerEvent,
    branch: Option<String>,
    tag: Option<String>,
) -> Result<EventContext> {
    EventContext::new(event, branch, tag).context("Invalid event")
}

#[derive(Serialize)]
struct PlannedJob<'a> {
    slug: String,
    #[serde(flatten)]
    job: &'a Job,
}

fn cmd_plan(
    config_path: &Path,
    event: TriggerEvent,
    branch: Option<String>,
    tag: Option<String>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let ctx = event_context(event, branch, tag)?;
    let orchestrator = Orchestrator::new(config, Arc::new(ProcessRunner));
    let jobs = orchestrator.plan(&ctx)?;

    let planned: Vec<PlannedJob> = jobs
        .iter()
        .map(|job| PlannedJob {
            slug: job.slug(),
            job,
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&planned)?);
    Ok(())
}

async fn cmd_run(
    config_path: &Path,
    event: TriggerEvent,
    branch: Option<String>,
    tag: Option<String>,
    events_out: Option<&Path>,
    report_json: bool,
) -> Result<i32> {
    let config = load_config(config_path)?;
    let ctx = event_context(event, branch, tag)?;
    let orchestrator = Orchestrator::new(config, Arc::new(ProcessRunner));

    let cancel = CancelHandle::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            on_interrupt.cancel();
        }
    });

    info!(event = %ctx.event, reference = %ctx.reference(), "starting run");
    let report = orchestrator
        .run(ctx, cancel)
        .await
        .context("Pipeline failed to run")?;

    if let Some(path) = events_out {
        std::fs::write(path, to_jsonl(&report.events)?)
            .with_context(|| format!("Failed to write event log {:?}", path))?;
    }

    if report_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(report.exit_code())
}

fn print_summary(report: &RunReport) {
    println!("Run ID: {}", report.event.run_id);
    println!("Event: {} ({})", report.event.event, report.event.reference());
    println!();

    for outcome in &report.outcomes {
        let status = if outcome.succeeded() { "✓" } else { "✗" };
        let advisory = if outcome.job.required { "" } else { " [advisory]" };
        match &outcome.failure {
            None => println!(
                "  {} {}{} ({} artifacts)",
                status,
                outcome.job.slug(),
                advisory,
                outcome.artifacts.len()
            ),
            Some(failure) => println!(
                "  {} {}{} failed at {} ({}): {}",
                status,
                outcome.job.slug(),
                advisory,
                failure.stage,
                failure.class,
                failure.message
            ),
        }
    }

    let succeeded = report.outcomes.iter().filter(|o| o.succeeded()).count();
    println!();
    println!("Summary: {}/{} jobs succeeded", succeeded, report.outcomes.len());
    println!(
        "Gate: {}",
        if report.verdict.passed {
            "✓ PASSED"
        } else {
            "✗ FAILED"
        }
    );

    if !report.verdict.violations.is_empty() {
        println!("Violations:");
        for violation in &report.verdict.violations {
            println!("  - {}", violation);
        }
    }
    if !report.verdict.warnings.is_empty() {
        println!("Warnings:");
        for warning in &report.verdict.warnings {
            println!("  - {}", warning);
        }
    }
}

fn cmd_check_config(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let matrix = &config.matrix;
    println!("✓ {:?} is valid", config_path);
    println!("Package: {}", config.package.name);
    println!(
        "Matrix: {} platforms × {} interpreters × {} architectures",
        matrix.platforms.len(),
        matrix.interpreter_versions.len(),
        matrix.architectures.len()
    );
    println!("Max parallel: {}", matrix.max_parallel);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_parse() {
        let cli = Cli::try_parse_from([
            "wheelhouse",
            "--config",
            "ci/wheelhouse.toml",
            "run",
            "--event",
            "release",
            "--tag",
            "v0.7.1",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("ci/wheelhouse.toml"));
        match cli.command {
            Commands::Run { event, tag, .. } => {
                assert_eq!(event, TriggerEvent::Release);
                assert_eq!(tag.as_deref(), Some("v0.7.1"));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        assert!(Cli::try_parse_from(["wheelhouse", "plan", "--event", "nightly"]).is_err());
    }

    #[test]
    fn test_check_config_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("wheelhouse.toml");
        std::fs::write(&path, "[package]\nname = \"aequilibrae\"\n").unwrap();
        cmd_check_config(&path).unwrap();
        assert!(cmd_check_config(&tmp.path().join("missing.toml")).is_err());
    }
}
