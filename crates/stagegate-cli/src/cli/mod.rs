//! CLI command definitions and shared rendering helpers for `sgate`.

pub mod dashboard;
pub mod list;
pub mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};
use uuid::Uuid;

use stagegate_types::run::RunStatus;

/// Quality-gated AI workflow runner.
#[derive(Parser)]
#[command(name = "sgate", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except results and errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans via the OpenTelemetry stdout exporter.
    #[arg(long, global = true, hide = true)]
    pub otel: bool,

    /// Data directory (config, database, run files).
    #[arg(long, global = true, env = "STAGEGATE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow definition from a YAML or JSON file.
    #[command(group = clap::ArgGroup::new("input").required(true))]
    Run {
        /// Path to the workflow definition file.
        file: PathBuf,

        /// Initial input passed to the workflow, inline.
        #[arg(long, group = "input")]
        input_text: Option<String>,

        /// Initial input read from a file.
        #[arg(long, group = "input")]
        input_file: Option<PathBuf>,

        /// Write the final output to a file instead of stdout.
        #[arg(long)]
        output_file: Option<PathBuf>,

        /// Override the per-substep attempt budget for this run.
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Continue a paused, crashed, or failed run from its checkpoint.
    Resume {
        /// Run UUID, as printed by `run` or `list`.
        run_id: String,
    },

    /// List persisted runs, most recently updated first.
    #[command(alias = "ls")]
    List {
        /// Filter by status (pending, running, paused, completed, failed).
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Read-only dashboard over persisted runs.
    Dashboard {
        /// Show one run's attempt history instead of the overview.
        run_id: Option<String>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Shared rendering helpers
// ---------------------------------------------------------------------------

/// Color-coded table cell for a run status.
pub(crate) fn status_cell(status: RunStatus) -> Cell {
    match status {
        RunStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        RunStatus::Running => Cell::new("running").fg(Color::Blue),
        RunStatus::Paused => Cell::new("paused").fg(Color::Magenta),
        RunStatus::Completed => Cell::new("completed").fg(Color::Green),
        RunStatus::Failed => Cell::new("failed").fg(Color::Red),
    }
}

/// First 8 characters of a run id, enough to disambiguate in listings.
pub(crate) fn short_id(run_id: Uuid) -> String {
    run_id.to_string().chars().take(8).collect()
}

pub(crate) fn format_tokens(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_requires_exactly_one_input_source() {
        use clap::Parser;
        assert!(Cli::try_parse_from(["sgate", "run", "wf.yaml"]).is_err());
        assert!(Cli::try_parse_from([
            "sgate",
            "run",
            "wf.yaml",
            "--input-text",
            "x",
            "--input-file",
            "in.txt"
        ])
        .is_err());
        assert!(Cli::try_parse_from(["sgate", "run", "wf.yaml", "--input-text", "x"]).is_ok());
    }

    #[test]
    fn test_format_tokens_scales() {
        assert_eq!(format_tokens(950), "950");
        assert_eq!(format_tokens(1_500), "1.5K");
        assert_eq!(format_tokens(2_000_000), "2.0M");
    }
}
