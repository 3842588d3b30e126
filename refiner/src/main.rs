//! Entropy-bounded workflow refiner.
//!
//! Validates and repairs workflow dependency graphs, diffs snapshots, and
//! runs the recursive refinement loop until the entropy governor halts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;

use refiner::core::diff::{AdaptiveThreshold, compute_diff_summary};
use refiner::core::graph::{execution_order, repair, validate};
use refiner::exit_codes;
use refiner::io::config::{ConfigOverrides, load_config};
use refiner::io::evaluator::ScoreFileEvaluator;
use refiner::io::snapshot_store::{FsSnapshotStore, NoSnapshots, SnapshotStore};
use refiner::io::telemetry_log::{JsonlTelemetryLog, NullSink, TelemetrySink, write_json};
use refiner::io::workflow_store::{load_workflow, write_workflow};
use refiner::logging;
use refiner::refine::{Collaborators, RefineOptions, RefineStop, run_refinement};

#[derive(Parser, Debug)]
#[command(
    name = "refiner",
    version,
    about = "Entropy-bounded workflow refinement loop"
)]
struct Cli {
    /// Refiner config (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = "refiner.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a workflow's dependency graph and print its execution order.
    Validate {
        workflow: PathBuf,
        /// Repair the graph per config policy and write the result here.
        #[arg(long)]
        repair: Option<PathBuf>,
    },
    /// Print the structural diff between two snapshots of one workflow.
    Diff {
        old: PathBuf,
        new: PathBuf,
        /// Regeneration threshold (defaults to `threshold.default` from config).
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Refine a workflow until the governor halts.
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    workflow: PathBuf,
    /// JSON array of per-metric score maps replayed by the evaluator.
    #[arg(long)]
    scores: PathBuf,
    /// Append telemetry records (JSONL) here.
    #[arg(long)]
    telemetry: Option<PathBuf>,
    /// Save committed snapshots under this directory.
    #[arg(long)]
    snapshots: Option<PathBuf>,
    /// Write the meta-metrics envelope here.
    #[arg(long)]
    meta_metrics: Option<PathBuf>,
    /// Write the final workflow here.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Disable recursion: evaluate once, never step the governor.
    #[arg(long)]
    no_refine: bool,
    #[arg(long)]
    entropy_budget: Option<f64>,
    /// Variants generated per cycle.
    #[arg(long)]
    variants: Option<usize>,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Validate { workflow, repair } => {
            cmd_validate(&cli.config, &workflow, repair.as_deref())
        }
        Command::Diff {
            old,
            new,
            threshold,
        } => cmd_diff(&cli.config, &old, &new, threshold),
        Command::Run(args) => cmd_run(&cli.config, &args),
    }
}

fn cmd_validate(config_path: &Path, workflow_path: &Path, repair_to: Option<&Path>) -> Result<i32> {
    let workflow = load_workflow(workflow_path)?;
    let Some(out) = repair_to else {
        validate(&workflow)
            .into_result()
            .with_context(|| format!("validate {}", workflow_path.display()))?;
        println!("{}", execution_order(&workflow)?.join("\n"));
        return Ok(exit_codes::OK);
    };

    let config = load_config(config_path)?;
    let repaired = repair(&workflow, &config.graph)
        .with_context(|| format!("repair {}", workflow_path.display()))?;
    write_workflow(out, &repaired)?;
    println!("{}", execution_order(&repaired)?.join("\n"));
    Ok(exit_codes::OK)
}

fn cmd_diff(config_path: &Path, old: &Path, new: &Path, threshold: Option<f64>) -> Result<i32> {
    let threshold = match threshold {
        Some(value) => AdaptiveThreshold::new(value)?,
        None => AdaptiveThreshold::new(load_config(config_path)?.threshold.default)?,
    };
    let summary = compute_diff_summary(&load_workflow(old)?, &load_workflow(new)?, threshold)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("serialize diff summary")?
    );
    Ok(if summary.regeneration_recommended {
        exit_codes::REGENERATE
    } else {
        exit_codes::OK
    })
}

fn cmd_run(config_path: &Path, args: &RunArgs) -> Result<i32> {
    let config = load_config(config_path)?.with_overrides(&ConfigOverrides {
        entropy_budget: args.entropy_budget,
        variants: args.variants,
    })?;
    let workflow = load_workflow(&args.workflow)?;
    let evaluator = ScoreFileEvaluator::load(&args.scores)?;
    let telemetry: Box<dyn TelemetrySink> = match &args.telemetry {
        Some(path) => Box::new(JsonlTelemetryLog::new(path)),
        None => Box::new(NullSink),
    };
    let snapshots: Box<dyn SnapshotStore> = match &args.snapshots {
        Some(dir) => Box::new(FsSnapshotStore::new(dir)),
        None => Box::new(NoSnapshots),
    };

    let run_id = format!(
        "{}-{}",
        workflow.workflow_id,
        Utc::now().format("%Y%m%d_%H%M%S")
    );
    let mut options = RefineOptions::new(run_id);
    options.refine = !args.no_refine;

    let collaborators = Collaborators::new(&evaluator, telemetry.as_ref(), snapshots.as_ref());
    let outcome = run_refinement(&workflow, &config, &options, &collaborators)?;

    if let Some(path) = &args.output {
        write_workflow(path, &outcome.workflow)?;
    }
    if let Some(path) = &args.meta_metrics {
        write_json(path, &outcome.meta_metrics)?;
    }

    let stop = match outcome.stop {
        RefineStop::Halted(reason) => reason.as_str(),
        RefineStop::Disabled => "disabled",
        RefineStop::Cancelled => "cancelled",
    };
    let summary = json!({
        "run_id": outcome.run_id,
        "stop": stop,
        "steps": outcome.steps,
        "committed": outcome.committed,
        "entropy_spent": outcome.entropy_spent,
        "threshold": outcome.threshold.value(),
        "version": outcome.workflow.version,
        "overall_score": outcome.scores.overall_score,
        "promotion_eligible": outcome.promotion.promotion_eligible,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("serialize run summary")?
    );
    Ok(if outcome.promotion.promotion_eligible {
        exit_codes::OK
    } else {
        exit_codes::NOT_PROMOTED
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "refiner",
            "run",
            "wf.json",
            "--scores",
            "scores.json",
            "--no-refine",
            "--entropy-budget",
            "0.5",
            "--variants",
            "4",
        ])
        .expect("parse");
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.no_refine);
        assert_eq!(args.entropy_budget, Some(0.5));
        assert_eq!(args.variants, Some(4));
        assert_eq!(cli.config, PathBuf::from("refiner.toml"));
    }

    #[test]
    fn run_requires_scores() {
        assert!(Cli::try_parse_from(["refiner", "run", "wf.json"]).is_err());
    }
}
