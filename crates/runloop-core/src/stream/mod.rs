//! Chunk streaming: the accumulator that folds provider output, and the
//! broker that fans run chunks out to live subscribers.

pub mod accumulator;
pub mod broker;

use runloop_types::chunk::Chunk;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use accumulator::{StreamResult, read_stream};
pub use broker::{BrokerError, BrokerOptions, ChunkSubscription, InProcessBroker, StreamBroker};

/// Publish every chunk received on `rx` to `broker` under its run id.
///
/// The key is taken from the first lifecycle chunk (the engine always emits
/// one before any model output); chunks seen before it are published once
/// the key is known. The key is closed after a terminal chunk, or when `rx`
/// ends. Publish errors are logged and skipped. Returns the run id.
pub async fn forward_to_broker<B: StreamBroker>(
    broker: &B,
    mut rx: mpsc::Receiver<Chunk>,
) -> Option<String> {
    let mut key: Option<String> = None;
    let mut early: Vec<Chunk> = Vec::new();

    while let Some(chunk) = rx.recv().await {
        if key.is_none() {
            match chunk.run_event() {
                Some(event) => key = Some(event.run_id.clone()),
                None => {
                    early.push(chunk);
                    continue;
                }
            }
        }
        let Some(run_id) = key.as_deref() else {
            continue;
        };

        for pending in early.drain(..) {
            publish_logged(broker, run_id, &pending).await;
        }
        publish_logged(broker, run_id, &chunk).await;

        if chunk.is_terminal() {
            break;
        }
    }

    match key.as_deref() {
        Some(run_id) => {
            if let Err(e) = broker.close(run_id).await {
                warn!(run_id, error = %e, "failed to close run stream");
            }
        }
        None => debug!(dropped = early.len(), "stream ended before any run event"),
    }
    key
}

async fn publish_logged<B: StreamBroker>(broker: &B, key: &str, chunk: &Chunk) {
    if let Err(e) = broker.publish(key, chunk).await {
        warn!(key, event = chunk.event_type(), error = %e, "publish failed");
    }
}
