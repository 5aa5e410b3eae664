//! `sgate list`: enumerate persisted runs.

use anyhow::{anyhow, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use stagegate_core::store::RunStore;
use stagegate_types::run::RunStatus;

use super::{format_tokens, short_id, status_cell};
use crate::state::AppState;

pub async fn handle_list(
    state: &AppState,
    status: Option<&str>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let filter = status
        .map(|s| s.parse::<RunStatus>().map_err(|e| anyhow!(e)))
        .transpose()?;

    let runs = state.store.list_runs(filter, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs recorded.");
        println!(
            "  Start one with: {}",
            style("sgate run <workflow.yaml> --input-text '...'").dim()
        );
        println!();
        return Ok(());
    }

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
            Cell::new("Error"),
        ]);

    for run in &runs {
        let error = run
            .error
            .as_deref()
            .map(|e| e.chars().take(40).collect::<String>())
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(short_id(run.run_id)),
            Cell::new(&run.workflow_name),
            status_cell(run.status),
            Cell::new(format_tokens(run.usage.total_tokens)),
            Cell::new(run.updated_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(error),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}
