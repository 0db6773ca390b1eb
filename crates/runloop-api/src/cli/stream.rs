//! Live stream commands: tail, close.

use anyhow::Result;
use console::style;
use tokio_util::sync::CancellationToken;

use runloop_core::stream::StreamBroker;
use runloop_types::chunk::Chunk;

use crate::state::AppState;

/// Print chunks of `run_id` as they arrive, until the stream closes or the
/// user interrupts.
pub async fn tail(state: &AppState, run_id: &str, nats_url: Option<String>, json: bool) -> Result<()> {
    let broker = state.broker(nats_url).await?;
    let cancel = CancellationToken::new();

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        crate::shutdown_signal().await;
        interrupt.cancel();
    });

    let mut subscription = broker.subscribe(run_id, cancel).await?;
    if !json {
        eprintln!(
            "  {} Following {} (Ctrl+C to stop)",
            style("~").cyan().bold(),
            style(run_id).cyan()
        );
    }

    while let Some(chunk) = subscription.recv().await {
        if json {
            println!("{}", serde_json::to_string(&chunk)?);
        } else {
            print_chunk(&chunk);
        }
    }

    if !json {
        eprintln!("  {} stream ended", style("~").dim());
    }
    Ok(())
}

/// Close the stream of `run_id`.
pub async fn close(state: &AppState, run_id: &str, nats_url: Option<String>, json: bool) -> Result<()> {
    let broker = state.broker(nats_url).await?;
    broker.close(run_id).await?;

    if json {
        println!("{}", serde_json::json!({"run_id": run_id, "closed": true}));
    } else {
        println!("  {} Closed stream {}", style("✓").green(), style(run_id).cyan());
    }
    Ok(())
}

fn print_chunk(chunk: &Chunk) {
    match chunk {
        Chunk::OutputTextDelta { delta, .. } => print!("{delta}"),
        Chunk::OutputItemDone { .. } => println!(),
        _ => {
            if let Some(event) = chunk.run_event() {
                println!(
                    "  {} {}",
                    style(chunk.event_type()).magenta().bold(),
                    style(&event.status).dim()
                );
                if let Some(error) = &event.error {
                    println!("  {} {error}", style("error").red().bold());
                }
            }
        }
    }
}
