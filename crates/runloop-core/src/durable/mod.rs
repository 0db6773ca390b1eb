//! Replay-safe decorators for durable execution.
//!
//! A durable-execution host may replay a step after a crash. Side effects
//! wrapped in [`run_once`] are recorded in a [`Journal`] under a stable key;
//! a replay returns the recorded result instead of repeating the effect.
//! [`JournaledTool`] applies this to tool calls, keyed by run and call id.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use runloop_types::llm::ToolDefinition;
use runloop_types::message::{FunctionCallMessage, FunctionCallOutputMessage};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::tool::{Tool, ToolContext, ToolError};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal storage error: {0}")]
    Storage(String),

    #[error("journal entry '{key}' could not be decoded: {message}")]
    Serialization { key: String, message: String },
}

impl From<JournalError> for ToolError {
    fn from(err: JournalError) -> Self {
        ToolError::Journal(err.to_string())
    }
}

/// Durable key-value record of completed effects.
pub trait Journal: Send + Sync {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Value>, JournalError>> + Send;

    fn put(&self, key: &str, value: Value) -> impl Future<Output = Result<(), JournalError>> + Send;
}

/// Process-local journal, for tests and single-process hosts.
#[derive(Debug, Default)]
pub struct InMemoryJournal {
    entries: DashMap<String, Value>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Journal for InMemoryJournal {
    async fn get(&self, key: &str) -> Result<Option<Value>, JournalError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), JournalError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// Run `f` at most once per `key`: return the journaled result if present,
/// otherwise run it and journal a successful result.
///
/// Failures are not journaled, so a replay retries them.
pub async fn run_once<J, T, E, F, Fut>(journal: &J, key: &str, f: F) -> Result<T, E>
where
    J: Journal,
    T: Serialize + DeserializeOwned,
    E: From<JournalError>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    if let Some(recorded) = journal.get(key).await? {
        debug!(key, "replaying journaled result");
        return serde_json::from_value(recorded).map_err(|e| {
            E::from(JournalError::Serialization {
                key: key.to_string(),
                message: e.to_string(),
            })
        });
    }

    let value = f().await?;
    let encoded = serde_json::to_value(&value).map_err(|e| JournalError::Serialization {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    journal.put(key, encoded).await?;
    Ok(value)
}

/// Tool decorator that executes each call at most once across replays.
pub struct JournaledTool<T: Tool, J: Journal> {
    inner: T,
    journal: Arc<J>,
}

impl<T: Tool, J: Journal> JournaledTool<T, J> {
    pub fn new(inner: T, journal: Arc<J>) -> Self {
        Self { inner, journal }
    }

    fn key(call: &FunctionCallMessage, ctx: &ToolContext) -> String {
        format!("tool:{}:{}", ctx.run_id, call.call_id)
    }
}

impl<T: Tool, J: Journal> Tool for JournaledTool<T, J> {
    fn definition(&self) -> ToolDefinition {
        self.inner.definition()
    }

    fn needs_approval(&self) -> bool {
        self.inner.needs_approval()
    }

    async fn execute(
        &self,
        call: &FunctionCallMessage,
        ctx: &ToolContext,
    ) -> Result<FunctionCallOutputMessage, ToolError> {
        let key = Self::key(call, ctx);
        run_once(self.journal.as_ref(), &key, || self.inner.execute(call, ctx)).await
    }
}
