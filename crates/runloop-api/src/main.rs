//! runloop CLI entry point.
//!
//! Binary name: `runloop`
//!
//! Parses CLI arguments, sets up tracing, loads configuration, then
//! dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,runloop_core=debug,runloop_infra=debug",
        _ => "trace",
    };
    runloop_observe::tracing_setup::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("tracing setup failed: {e}"))?;

    let result = run(cli).await;
    runloop_observe::tracing_setup::shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init().await?;

    match cli.command {
        Commands::History {
            message_id,
            namespace,
        } => cli::history::history(&state, &namespace, &message_id, cli.json).await,

        Commands::Threads {
            conversation_id,
            namespace,
        } => cli::history::threads(&state, &namespace, &conversation_id, cli.json).await,

        Commands::Tail { run_id, nats_url } => {
            cli::stream::tail(&state, &run_id, nats_url, cli.json).await
        }

        Commands::Close { run_id, nats_url } => {
            cli::stream::close(&state, &run_id, nats_url, cli.json).await
        }

        Commands::Config => cli::config::show(&state, cli.json),
    }
}

/// Wait for Ctrl+C or SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
