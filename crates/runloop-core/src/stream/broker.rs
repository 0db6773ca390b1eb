//! Stream broker: pub/sub of run chunks keyed by run id.
//!
//! The broker is best effort and never the system of record. Subscribers
//! only see chunks published after they subscribed. Closing a key releases
//! its subscribers and marks the key closed for a while, so that a late
//! subscriber gets an already-finished handle instead of waiting forever.
//!
//! `InProcessBroker` fans out within one process. A cross-process broker
//! lives in runloop-infra.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::Stream;
use runloop_types::chunk::Chunk;
use runloop_types::config::BrokerSection;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// Default bounded queue size per subscriber.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Default time a publish waits on one full subscriber queue.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_millis(250);

/// Default lifetime of a closed marker.
pub const DEFAULT_CLOSED_TTL: Duration = Duration::from_secs(600);

/// Errors from broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("close failed: {0}")]
    Close(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Pub/sub port for run chunks.
///
/// Uses native async fn in traits (RPITIT).
pub trait StreamBroker: Send + Sync {
    /// Deliver `chunk` to the current subscribers of `key`. Fire-and-forget:
    /// slow or gone subscribers never fail the publish.
    fn publish(
        &self,
        key: &str,
        chunk: &Chunk,
    ) -> impl std::future::Future<Output = Result<(), BrokerError>> + Send;

    /// Receive chunks published to `key` from now on, until the key is closed
    /// or `cancel` fires. Subscribing to a closed key yields a finished handle.
    fn subscribe(
        &self,
        key: &str,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<ChunkSubscription, BrokerError>> + Send;

    /// Release all subscribers of `key` and mark it closed.
    fn close(&self, key: &str) -> impl std::future::Future<Output = Result<(), BrokerError>> + Send;
}

/// Receiving side of a subscription.
///
/// Dropping the subscription unsubscribes.
pub struct ChunkSubscription {
    rx: mpsc::Receiver<Chunk>,
    _guard: Option<DropGuard>,
}

impl ChunkSubscription {
    pub fn new(rx: mpsc::Receiver<Chunk>, guard: Option<DropGuard>) -> Self {
        Self { rx, _guard: guard }
    }

    /// A handle that yields nothing.
    pub fn closed() -> Self {
        let (_, rx) = mpsc::channel(1);
        Self { rx, _guard: None }
    }

    /// Next chunk, or `None` once the key is closed or the subscription cancelled.
    pub async fn recv(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }

    pub fn into_stream(mut self) -> impl Stream<Item = Chunk> + Send {
        async_stream::stream! {
            while let Some(chunk) = self.rx.recv().await {
                yield chunk;
            }
        }
    }
}

impl std::fmt::Debug for ChunkSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSubscription").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// In-process broker
// ---------------------------------------------------------------------------

struct Subscriber {
    tx: mpsc::Sender<Chunk>,
    guard: CancellationToken,
}

#[derive(Default)]
struct ChannelState {
    closed_at: Option<Instant>,
    subscribers: HashMap<u64, Subscriber>,
}

impl ChannelState {
    fn is_closed(&self, ttl: Duration) -> bool {
        self.closed_at.is_some_and(|at| at.elapsed() < ttl)
    }
}

/// Tuning for [`InProcessBroker`].
#[derive(Debug, Clone, Copy)]
pub struct BrokerOptions {
    pub subscriber_buffer: usize,
    pub publish_timeout: Duration,
    pub closed_ttl: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            closed_ttl: DEFAULT_CLOSED_TTL,
        }
    }
}

impl From<&BrokerSection> for BrokerOptions {
    fn from(section: &BrokerSection) -> Self {
        Self {
            subscriber_buffer: section.subscriber_buffer.max(1),
            publish_timeout: Duration::from_millis(section.publish_timeout_ms),
            closed_ttl: Duration::from_secs(section.closed_marker_ttl_secs),
        }
    }
}

/// Fan-out broker for a single process.
///
/// Each subscriber owns a bounded `mpsc` queue. Publish snapshots the
/// current senders and never holds a map lock across an await.
#[derive(Clone)]
pub struct InProcessBroker {
    channels: Arc<DashMap<String, ChannelState>>,
    next_id: Arc<AtomicU64>,
    options: BrokerOptions,
}

impl Default for InProcessBroker {
    fn default() -> Self {
        Self::new(BrokerOptions::default())
    }
}

impl InProcessBroker {
    pub fn new(options: BrokerOptions) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            options,
        }
    }

    /// Number of live subscribers on `key`.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.channels
            .get(key)
            .map(|state| state.subscribers.len())
            .unwrap_or(0)
    }

    fn remove_subscribers(channels: &DashMap<String, ChannelState>, key: &str, ids: &[u64]) {
        if let Some(mut state) = channels.get_mut(key) {
            for id in ids {
                if let Some(sub) = state.subscribers.remove(id) {
                    sub.guard.cancel();
                }
            }
        }
        channels.remove_if(key, |_, state| {
            state.closed_at.is_none() && state.subscribers.is_empty()
        });
    }

    fn prune_expired(&self) {
        let ttl = self.options.closed_ttl;
        self.channels
            .retain(|_, state| !(state.closed_at.is_some() && !state.is_closed(ttl)));
    }
}

impl StreamBroker for InProcessBroker {
    async fn publish(&self, key: &str, chunk: &Chunk) -> Result<(), BrokerError> {
        let senders: Vec<(u64, mpsc::Sender<Chunk>)> = match self.channels.get(key) {
            Some(state) if !state.is_closed(self.options.closed_ttl) => state
                .subscribers
                .iter()
                .map(|(id, sub)| (*id, sub.tx.clone()))
                .collect(),
            _ => return Ok(()),
        };

        let mut gone = Vec::new();
        for (id, tx) in senders {
            match tokio::time::timeout(self.options.publish_timeout, tx.send(chunk.clone())).await
            {
                Ok(Ok(())) => {}
                Ok(Err(_)) => gone.push(id),
                Err(_) => warn!(
                    key,
                    subscriber = id,
                    event = chunk.event_type(),
                    "subscriber queue full, dropping chunk"
                ),
            }
        }

        if !gone.is_empty() {
            debug!(key, count = gone.len(), "pruning closed subscribers");
            Self::remove_subscribers(&self.channels, key, &gone);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        key: &str,
        cancel: CancellationToken,
    ) -> Result<ChunkSubscription, BrokerError> {
        let ttl = self.options.closed_ttl;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.options.subscriber_buffer);
        let guard = cancel.child_token();

        {
            let mut state = self.channels.entry(key.to_string()).or_default();
            if state.is_closed(ttl) {
                debug!(key, "subscribe to closed stream");
                return Ok(ChunkSubscription::closed());
            }
            state.closed_at = None;
            state.subscribers.insert(
                id,
                Subscriber {
                    tx,
                    guard: guard.clone(),
                },
            );
        }

        let channels = Arc::clone(&self.channels);
        let owned_key = key.to_string();
        let watched = guard.clone();
        tokio::spawn(async move {
            watched.cancelled().await;
            Self::remove_subscribers(&channels, &owned_key, &[id]);
        });

        debug!(key, subscriber = id, "subscribed");
        Ok(ChunkSubscription::new(rx, Some(guard.drop_guard())))
    }

    async fn close(&self, key: &str) -> Result<(), BrokerError> {
        let released = {
            let mut state = self.channels.entry(key.to_string()).or_default();
            state.closed_at = Some(Instant::now());
            let subscribers = std::mem::take(&mut state.subscribers);
            for sub in subscribers.values() {
                sub.guard.cancel();
            }
            subscribers.len()
        };
        debug!(key, released, "stream closed");
        self.prune_expired();
        Ok(())
    }
}

impl std::fmt::Debug for InProcessBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessBroker")
            .field("channels", &self.channels.len())
            .field("options", &self.options)
            .finish()
    }
}
