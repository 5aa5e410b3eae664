//! `sgate dashboard`: read-only viewer over the run store.
//!
//! Without a run id: status counts, token totals, and the most recent
//! runs. With a run id: that run's checkpoint state and full attempt
//! history. Reads only; shares no in-process state with the engine.

use anyhow::{Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use uuid::Uuid;

use stagegate_core::store::RunStore;
use stagegate_types::run::{RunStatus, SubstepAttempt};

use super::{format_tokens, short_id, status_cell};
use crate::state::AppState;

/// Overview scans at most this many runs.
const OVERVIEW_SCAN_LIMIT: u32 = 200;

/// Rows shown in the overview's recent-runs table.
const RECENT_RUNS: usize = 10;

pub async fn handle_dashboard(
    state: &AppState,
    run_id: Option<&str>,
    json: bool,
) -> Result<()> {
    match run_id {
        Some(raw) => {
            let run_id: Uuid = raw
                .parse()
                .with_context(|| format!("invalid run id '{raw}'"))?;
            show_run(state, run_id, json).await
        }
        None => show_overview(state, json).await,
    }
}

// ---------------------------------------------------------------------------
// Overview
// ---------------------------------------------------------------------------

async fn show_overview(state: &AppState, json: bool) -> Result<()> {
    let runs = state.store.list_runs(None, OVERVIEW_SCAN_LIMIT).await?;

    let count = |status: RunStatus| runs.iter().filter(|r| r.status == status).count();
    let completed = count(RunStatus::Completed);
    let failed = count(RunStatus::Failed);
    let paused = count(RunStatus::Paused);
    let active = count(RunStatus::Running) + count(RunStatus::Pending);
    let total_tokens: u64 = runs.iter().map(|r| r.usage.total_tokens).sum();

    if json {
        let out = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "data_dir": state.data_dir.display().to_string(),
            "runs": {
                "total": runs.len(),
                "completed": completed,
                "failed": failed,
                "paused": paused,
                "active": active,
            },
            "total_tokens": total_tokens,
            "recent": runs.iter().take(RECENT_RUNS).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Stagegate v{}",
        style("*").bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!();

    println!("  {}", style("-- Runs --").dim());
    println!("  Total:     {}", style(runs.len()).bold());
    println!("  Completed: {}", style(completed).green());
    if failed > 0 {
        println!("  Failed:    {}", style(failed).red());
    }
    if paused > 0 {
        println!("  Paused:    {}", style(paused).yellow());
    }
    if active > 0 {
        println!("  Active:    {}", style(active).blue());
    }
    println!();

    println!("  {}", style("-- Usage --").dim());
    println!("  Tokens used: {}", format_tokens(total_tokens));
    println!();

    if !runs.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Run").fg(Color::Cyan),
                Cell::new("Workflow"),
                Cell::new("Status"),
                Cell::new("Tokens"),
                Cell::new("Updated"),
            ]);
        for run in runs.iter().take(RECENT_RUNS) {
            table.add_row(vec![
                Cell::new(short_id(run.run_id)),
                Cell::new(&run.workflow_name),
                status_cell(run.status),
                Cell::new(format_tokens(run.usage.total_tokens)),
                Cell::new(run.updated_at.format("%Y-%m-%d %H:%M").to_string()),
            ]);
        }
        println!("{table}");
        println!();
    }

    println!("  {}", style("-- System --").dim());
    println!("  Data dir: {}", style(state.data_dir.display()).dim());
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Single run
// ---------------------------------------------------------------------------

async fn show_run(state: &AppState, run_id: Uuid, json: bool) -> Result<()> {
    let run = state
        .store
        .get_run(run_id)
        .await
        .with_context(|| format!("run {run_id} not found"))?;
    let attempts = state.store.list_attempts(run_id).await?;

    if json {
        let out = serde_json::json!({
            "run_id": run.run_id,
            "workflow_id": run.workflow_id,
            "workflow_name": run.workflow_name,
            "status": run.status,
            "step_cursor": run.context.cursor(),
            "usage": run.usage,
            "error": run.error,
            "created_at": run.created_at.to_rfc3339(),
            "updated_at": run.updated_at.to_rfc3339(),
            "attempts": attempts,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Run {}",
        style("*").bold(),
        style(short_id(run.run_id)).cyan()
    );
    println!("  Workflow: {}", style(&run.workflow_name).cyan());
    println!("  Status:   {}", run.status);
    println!("  Tokens:   {}", format_tokens(run.usage.total_tokens));
    println!("  Started:  {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated:  {}", run.updated_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(error) = &run.error {
        println!("  Error:    {}", style(error).red());
    }
    println!();

    if attempts.is_empty() {
        println!("  No attempts recorded yet.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Substep"),
            Cell::new("Try"),
            Cell::new("Accepted"),
            Cell::new("Score"),
            Cell::new("Tokens"),
            Cell::new("Latency"),
            Cell::new("Detail"),
        ]);

    for attempt in &attempts {
        let accepted = if attempt.accepted {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::Red)
        };
        let score = attempt
            .score
            .as_ref()
            .map(|s| format!("{:.2}", s.value))
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(&attempt.step_id),
            Cell::new(&attempt.substep_id),
            Cell::new(format!("{}.{}", attempt.step_attempt, attempt.attempt)),
            accepted,
            Cell::new(score),
            Cell::new(format_tokens(attempt.usage.total_tokens)),
            Cell::new(format!("{}ms", attempt.latency_ms)),
            Cell::new(attempt_detail(attempt)),
        ]);
    }

    println!("{table}");
    println!();

    Ok(())
}

/// What went wrong on this attempt, truncated for the table.
fn attempt_detail(attempt: &SubstepAttempt) -> String {
    let detail = attempt
        .error
        .as_deref()
        .or_else(|| {
            attempt
                .score
                .as_ref()
                .and_then(|s| s.failed_checks().next())
                .and_then(|c| c.detail.as_deref())
        })
        .unwrap_or("-");
    detail.chars().take(48).collect()
}
