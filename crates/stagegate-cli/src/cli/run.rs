//! `sgate run` and `sgate resume`: attached workflow execution.
//!
//! Both commands drive the run in the foreground. Ctrl-C requests a
//! cooperative pause; the engine honors it at the next step boundary
//! and the process exits 0 with a resume hint.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use uuid::Uuid;

use stagegate_core::store::BoxRunStore;
use stagegate_core::workflow::orchestrator::{Orchestrator, RunOutcome, WorkflowEngine};
use stagegate_types::run::RunStatus;
use stagegate_types::workflow::WorkflowDefinition;

use super::{format_tokens, short_id};
use crate::state::AppState;

pub async fn handle_run(
    state: &AppState,
    file: &Path,
    input_text: Option<&str>,
    input_file: Option<&Path>,
    output_file: Option<&Path>,
    max_retries: Option<u32>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let definition = load_definition(file).await?;

    let input = match (input_text, input_file) {
        (Some(text), _) => text.to_string(),
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read input file {}", path.display()))?,
        (None, None) => unreachable!("clap requires one input source"),
    };

    let engine = Arc::new(state.build_engine(max_retries).await?);
    let run_id = engine.prepare(&definition, &input).await?;

    if !json && !quiet {
        println!();
        println!(
            "  {} Running '{}' ({} steps) as {}",
            style("*").green().bold(),
            style(&definition.name).cyan(),
            definition.steps.len(),
            style(short_id(run_id)).dim()
        );
    }

    let outcome = drive_attached(engine, run_id, json, quiet).await?;
    finish_outcome(&outcome, output_file, json, quiet).await
}

pub async fn handle_resume(
    state: &AppState,
    run_id_str: &str,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let run_id: Uuid = run_id_str
        .parse()
        .with_context(|| format!("invalid run id '{run_id_str}'"))?;

    let engine = Arc::new(state.build_engine(None).await?);

    if !json && !quiet {
        println!();
        println!(
            "  {} Resuming run {}",
            style("*").green().bold(),
            style(short_id(run_id)).cyan()
        );
    }

    let outcome = drive_attached(engine, run_id, json, quiet).await?;
    finish_outcome(&outcome, None, json, quiet).await
}

/// Parse a workflow definition file, JSON or YAML by extension.
async fn load_definition(file: &Path) -> Result<WorkflowDefinition> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("cannot read workflow file {}", file.display()))?;

    let is_json = file
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let definition = if is_json {
        WorkflowDefinition::from_json(&raw)
    } else {
        WorkflowDefinition::from_yaml(&raw)
    };
    definition.with_context(|| format!("invalid workflow definition {}", file.display()))
}

/// Drive a prepared or persisted run to its next terminal or parked
/// state, with a Ctrl-C pause handler and a spinner attached.
async fn drive_attached(
    engine: Arc<Orchestrator<BoxRunStore>>,
    run_id: Uuid,
    json: bool,
    quiet: bool,
) -> Result<RunOutcome> {
    let watcher = tokio::spawn({
        let engine = engine.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!();
                eprintln!("  pausing at the next step boundary...");
                engine.cancel(run_id);
            }
        }
    });

    let spinner = if json || quiet {
        ProgressBar::hidden()
    } else {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("  {spinner} {msg}").expect("static spinner template"),
        );
        spinner.set_message("executing steps (Ctrl-C to pause)");
        spinner.enable_steady_tick(Duration::from_millis(120));
        spinner
    };

    let result = engine.drive(run_id).await;
    spinner.finish_and_clear();
    watcher.abort();

    Ok(result?)
}

/// Write the output file, render the outcome, and map a failed run to
/// a non-zero exit.
async fn finish_outcome(
    outcome: &RunOutcome,
    output_file: Option<&Path>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let mut wrote_output = false;
    if let (Some(path), Some(text)) = (output_file, outcome.final_output.as_deref()) {
        tokio::fs::write(path, text)
            .await
            .with_context(|| format!("cannot write output file {}", path.display()))?;
        wrote_output = true;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else {
        render_styled(outcome, wrote_output, quiet);
    }

    if outcome.status == RunStatus::Failed {
        bail!(
            "run {} failed: {}",
            short_id(outcome.run_id),
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn render_styled(outcome: &RunOutcome, wrote_output: bool, quiet: bool) {
    match outcome.status {
        RunStatus::Completed => {
            if let (false, Some(text)) = (wrote_output, outcome.final_output.as_deref()) {
                if !quiet {
                    println!();
                }
                println!("{text}");
            }
            if !quiet {
                println!();
                println!(
                    "  {} Run {} completed ({} tokens)",
                    style("*").green().bold(),
                    style(short_id(outcome.run_id)).cyan(),
                    format_tokens(outcome.usage.total_tokens)
                );
                println!();
            }
        }
        RunStatus::Paused => {
            println!();
            println!(
                "  {} Run {} paused at a step boundary",
                style("*").yellow().bold(),
                style(short_id(outcome.run_id)).cyan()
            );
            println!(
                "  Continue with: {}",
                style(format!("sgate resume {}", outcome.run_id)).dim()
            );
            println!();
        }
        // The bail in finish_outcome carries the error detail.
        RunStatus::Failed | RunStatus::Pending | RunStatus::Running => {}
    }
}
