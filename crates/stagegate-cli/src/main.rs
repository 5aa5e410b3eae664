//! Stagegate CLI entry point.
//!
//! Binary name: `sgate`
//!
//! Parses CLI arguments, wires the storage backend and model provider
//! from configuration, then dispatches to the command handlers. Exit
//! code is 0 on workflow completion or pause, non-zero on workflow
//! failure or any CLI-level error.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,stagegate=debug",
        _ => "trace",
    };
    stagegate_observe::tracing_setup::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "sgate", &mut std::io::stdout());
        return Ok(());
    }

    // Wire config, data directory, and the storage backend
    let state = AppState::init(cli.data_dir.clone()).await?;

    let result = match cli.command {
        Commands::Run {
            file,
            input_text,
            input_file,
            output_file,
            max_retries,
        } => {
            cli::run::handle_run(
                &state,
                &file,
                input_text.as_deref(),
                input_file.as_deref(),
                output_file.as_deref(),
                max_retries,
                cli.json,
                cli.quiet,
            )
            .await
        }

        Commands::Resume { run_id } => {
            cli::run::handle_resume(&state, &run_id, cli.json, cli.quiet).await
        }

        Commands::List { status, limit } => {
            cli::list::handle_list(&state, status.as_deref(), limit, cli.json).await
        }

        Commands::Dashboard { run_id } => {
            cli::dashboard::handle_dashboard(&state, run_id.as_deref(), cli.json).await
        }

        Commands::Completions { .. } => unreachable!("handled above"),
    };

    stagegate_observe::tracing_setup::shutdown_tracing();
    result
}
