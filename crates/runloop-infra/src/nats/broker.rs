//! Cross-process stream broker over NATS.
//!
//! Chunks for key `k` are published as JSON frames on `runloop.stream.{k}`,
//! with `k` in unpadded URL-safe base64 so every key is one subject token.
//! Closing a key writes a marker into a JetStream key-value bucket (expiring
//! after the configured TTL) and then publishes a close frame, which ends
//! every live subscription. A subscriber registers interest before it checks
//! the marker, so a close racing a subscribe is never missed.

use std::time::Duration;

use async_nats::jetstream::{self, kv};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures_util::StreamExt;
use runloop_core::stream::{BrokerError, ChunkSubscription, StreamBroker};
use runloop_types::chunk::Chunk;
use runloop_types::config::BrokerSection;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SUBJECT_PREFIX: &str = "runloop.stream";
const CLOSED_BUCKET: &str = "runloop_stream_closed";

/// Wire envelope of one broker message.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
enum BrokerFrame {
    Chunk { chunk: Chunk },
    Close,
}

/// Map a key onto a single NATS subject token (also a valid KV key).
/// Distinct keys always get distinct tokens.
fn encode_key(key: &str) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

fn subject(key: &str) -> String {
    format!("{SUBJECT_PREFIX}.{}", encode_key(key))
}

fn encode(frame: &BrokerFrame) -> Result<Vec<u8>, BrokerError> {
    serde_json::to_vec(frame).map_err(|e| BrokerError::Serialization(e.to_string()))
}

/// [`StreamBroker`] backed by NATS core pub/sub and a JetStream KV bucket.
#[derive(Clone)]
pub struct NatsStreamBroker {
    client: async_nats::Client,
    closed: kv::Store,
    subscriber_buffer: usize,
    publish_timeout: Duration,
}

impl NatsStreamBroker {
    /// Connect to `section.nats_url` and ensure the closed-marker bucket exists.
    pub async fn connect(section: &BrokerSection) -> Result<Self, BrokerError> {
        let client = async_nats::connect(&section.nats_url)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Self::with_client(
            client,
            Duration::from_secs(section.closed_marker_ttl_secs),
            section.subscriber_buffer,
            Duration::from_millis(section.publish_timeout_ms),
        )
        .await
    }

    /// Build a broker on an already-connected client.
    pub async fn with_client(
        client: async_nats::Client,
        closed_ttl: Duration,
        subscriber_buffer: usize,
        publish_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let js = jetstream::new(client.clone());
        let closed = match js.get_key_value(CLOSED_BUCKET).await {
            Ok(store) => store,
            Err(_) => js
                .create_key_value(kv::Config {
                    bucket: CLOSED_BUCKET.to_string(),
                    history: 1,
                    max_age: closed_ttl,
                    ..Default::default()
                })
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?,
        };
        debug!(bucket = CLOSED_BUCKET, ttl_secs = closed_ttl.as_secs(), "nats broker ready");

        Ok(Self {
            client,
            closed,
            subscriber_buffer: subscriber_buffer.max(1),
            publish_timeout,
        })
    }

    async fn is_closed(&self, key: &str) -> Result<bool, BrokerError> {
        self.closed
            .get(encode_key(key))
            .await
            .map(|entry| entry.is_some())
            .map_err(|e| BrokerError::Subscribe(e.to_string()))
    }

    async fn send(&self, key: &str, frame: &BrokerFrame) -> Result<(), BrokerError> {
        let payload = encode(frame)?;
        tokio::time::timeout(
            self.publish_timeout,
            self.client.publish(subject(key), payload.into()),
        )
        .await
        .map_err(|_| BrokerError::Publish(format!("publish to '{key}' timed out")))?
        .map_err(|e| BrokerError::Publish(e.to_string()))
    }
}

impl StreamBroker for NatsStreamBroker {
    async fn publish(&self, key: &str, chunk: &Chunk) -> Result<(), BrokerError> {
        self.send(key, &BrokerFrame::Chunk { chunk: chunk.clone() }).await
    }

    async fn subscribe(
        &self,
        key: &str,
        cancel: CancellationToken,
    ) -> Result<ChunkSubscription, BrokerError> {
        let mut subscriber = self
            .client
            .subscribe(subject(key))
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
        // Make sure the server knows about the interest before the marker check.
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

        if self.is_closed(key).await? {
            debug!(key, "subscribe to closed stream");
            if let Err(e) = subscriber.unsubscribe().await {
                debug!(key, error = %e, "unsubscribe failed");
            }
            return Ok(ChunkSubscription::closed());
        }

        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        let token = cancel.child_token();
        let watch = token.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = watch.cancelled() => break,
                    message = subscriber.next() => message,
                };
                let Some(message) = message else { break };

                match serde_json::from_slice::<BrokerFrame>(&message.payload) {
                    Ok(BrokerFrame::Chunk { chunk }) => {
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    Ok(BrokerFrame::Close) => break,
                    Err(e) => warn!(key = %key, error = %e, "dropping undecodable frame"),
                }
            }
            if let Err(e) = subscriber.unsubscribe().await {
                debug!(key = %key, error = %e, "unsubscribe failed");
            }
        });

        Ok(ChunkSubscription::new(rx, Some(token.drop_guard())))
    }

    async fn close(&self, key: &str) -> Result<(), BrokerError> {
        self.closed
            .put(encode_key(key), "closed".into())
            .await
            .map_err(|e| BrokerError::Close(e.to_string()))?;
        self.send(key, &BrokerFrame::Close).await?;
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Close(e.to_string()))
    }
}

impl std::fmt::Debug for NatsStreamBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsStreamBroker")
            .field("subscriber_buffer", &self.subscriber_buffer)
            .field("publish_timeout", &self.publish_timeout)
            .finish_non_exhaustive()
    }
}
