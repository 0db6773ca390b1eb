//! Application state shared by the CLI commands.
//!
//! Holds the resolved data directory and runtime configuration, and opens
//! the SQLite store or NATS broker on demand so that commands only pay for
//! the backends they use.

use std::path::PathBuf;

use anyhow::{Context, bail};
use runloop_infra::config::{load_config, resolve_data_dir};
use runloop_infra::nats::NatsStreamBroker;
use runloop_infra::sqlite::pool::default_database_url;
use runloop_infra::sqlite::{DatabasePool, SqliteConversationStore};
use runloop_types::config::{BrokerKind, RuntimeConfig};

pub struct AppState {
    pub data_dir: PathBuf,
    pub config: RuntimeConfig,
}

impl AppState {
    /// Resolve the data directory and load `config.toml` from it.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;
        let config = load_config(&data_dir).await;
        Ok(Self { data_dir, config })
    }

    /// `storage.database_url`, or `runloop.db` in the data directory.
    pub fn database_url(&self) -> String {
        match &self.config.storage.database_url {
            Some(url) => url.clone(),
            None => format!("{}?mode=rwc", default_database_url(&self.data_dir)),
        }
    }

    pub async fn store(&self) -> anyhow::Result<SqliteConversationStore> {
        let url = self.database_url();
        let pool = DatabasePool::new(&url)
            .await
            .with_context(|| format!("cannot open database {url}"))?;
        Ok(SqliteConversationStore::new(pool))
    }

    /// Connect to NATS. `nats_url` overrides `broker.nats_url`.
    pub async fn broker(&self, nats_url: Option<String>) -> anyhow::Result<NatsStreamBroker> {
        let mut section = self.config.broker.clone();
        match nats_url {
            Some(url) => section.nats_url = url,
            None if section.kind != BrokerKind::Nats => bail!(
                "live streams need a cross-process broker: set [broker] kind = \"nats\" or pass --nats-url"
            ),
            None => {}
        }
        NatsStreamBroker::connect(&section)
            .await
            .with_context(|| format!("cannot connect to {}", section.nats_url))
    }
}
