//! Runtime configuration types for runloop.
//!
//! `RuntimeConfig` represents `config.toml` in the runloop data directory.
//! Every section and field has a default, so an empty file is valid.

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub summarizer: SummarizerSection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub storage: StorageSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Upper bound on LLM calls per `execute`.
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
}

fn default_max_loops() -> u32 {
    10
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_loops: default_max_loops(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerSection {
    /// Summarize once a run's accumulated total tokens exceed this.
    #[serde(default = "default_token_threshold")]
    pub token_threshold: u64,
    /// Number of most recent runs kept verbatim.
    #[serde(default = "default_keep_recent_runs")]
    pub keep_recent_runs: usize,
}

fn default_token_threshold() -> u64 {
    100_000
}

fn default_keep_recent_runs() -> usize {
    4
}

impl Default for SummarizerSection {
    fn default() -> Self {
        Self {
            token_threshold: default_token_threshold(),
            keep_recent_runs: default_keep_recent_runs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Memory,
    Nats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSection {
    #[serde(default)]
    pub kind: BrokerKind,
    #[serde(default = "default_nats_url")]
    pub nats_url: String,
    /// Bounded queue size per subscriber.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// How long publish waits on a full subscriber queue before dropping.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// Lifetime of the "closed" marker for a stream key.
    #[serde(default = "default_closed_marker_ttl_secs")]
    pub closed_marker_ttl_secs: u64,
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_publish_timeout_ms() -> u64 {
    250
}

fn default_closed_marker_ttl_secs() -> u64 {
    600
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            nats_url: default_nats_url(),
            subscriber_buffer: default_subscriber_buffer(),
            publish_timeout_ms: default_publish_timeout_ms(),
            closed_marker_ttl_secs: default_closed_marker_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSection {
    /// SQLite URL. Defaults to `{data_dir}/runloop.db` when unset.
    #[serde(default)]
    pub database_url: Option<String>,
}
