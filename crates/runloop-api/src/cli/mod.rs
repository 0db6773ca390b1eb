//! CLI command definitions for the `runloop` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod config;
pub mod history;
pub mod stream;

use clap::{Parser, Subcommand};

/// Inspect runloop conversations and live run streams.
#[derive(Parser)]
#[command(name = "runloop", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "RUNLOOP_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the thread ending at a run record.
    History {
        /// Run (message record) id to read up to.
        message_id: String,

        /// Namespace the conversation lives in.
        #[arg(short, long, default_value = "default")]
        namespace: String,
    },

    /// List the threads (branches) of a conversation.
    Threads {
        /// Conversation id.
        conversation_id: String,

        /// Namespace the conversation lives in.
        #[arg(short, long, default_value = "default")]
        namespace: String,
    },

    /// Follow a run's live chunk stream until it closes.
    Tail {
        /// Run id to subscribe to.
        run_id: String,

        /// NATS server URL (overrides `[broker] nats_url`).
        #[arg(long, env = "RUNLOOP_NATS_URL")]
        nats_url: Option<String>,
    },

    /// Close a run's stream, releasing its subscribers.
    Close {
        /// Run id whose stream to close.
        run_id: String,

        /// NATS server URL (overrides `[broker] nats_url`).
        #[arg(long, env = "RUNLOOP_NATS_URL")]
        nats_url: Option<String>,
    },

    /// Show the effective configuration.
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        <Cli as clap::CommandFactory>::command().debug_assert();
    }

    #[test]
    fn test_parse_history_with_namespace() {
        let cli = Cli::parse_from(["runloop", "history", "msg_1", "-n", "team", "--json"]);
        assert!(cli.json);
        match cli.command {
            Commands::History {
                message_id,
                namespace,
            } => {
                assert_eq!(message_id, "msg_1");
                assert_eq!(namespace, "team");
            }
            _ => panic!("expected history"),
        }
    }
}
