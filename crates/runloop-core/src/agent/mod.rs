//! Agent execution.
//!
//! - `Agent`: model, instruction, tools and handoffs
//! - `AgentEngine`: the run state-machine loop over a `ConversationRunManager`
//! - `Runtime`: an alternate execution strategy the engine can delegate to

pub mod definition;
pub mod engine;
pub mod error;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use runloop_types::agent::AgentOutput;
use runloop_types::chunk::Chunk;
use runloop_types::message::{Message, RunContext};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use definition::{Agent, Handoff, Instruction, SystemPromptProvider};
pub use engine::{AgentEngine, EngineConfig};
pub use error::AgentError;

/// Input of one `execute` call.
#[derive(Debug, Clone)]
pub struct AgentInput {
    pub namespace: String,
    /// The record to continue from: the last `AgentOutput::run_id`, or `None`
    /// for a new conversation.
    pub previous_message_id: Option<String>,
    pub messages: Vec<Message>,
    pub run_context: RunContext,
    /// Receives model chunks and lifecycle chunks in order.
    pub callback: Option<mpsc::Sender<Chunk>>,
}

impl AgentInput {
    pub fn new(namespace: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            namespace: namespace.into(),
            previous_message_id: None,
            messages,
            run_context: RunContext::new(),
            callback: None,
        }
    }

    pub fn continuing(mut self, previous_message_id: impl Into<String>) -> Self {
        self.previous_message_id = Some(previous_message_id.into());
        self
    }

    pub fn with_context(mut self, run_context: RunContext) -> Self {
        self.run_context = run_context;
        self
    }

    pub fn with_callback(mut self, callback: mpsc::Sender<Chunk>) -> Self {
        self.callback = Some(callback);
        self
    }
}

/// Boxed future returned by [`Runtime::run`].
pub type RunFuture<'a> = Pin<Box<dyn Future<Output = Result<AgentOutput, AgentError>> + Send + 'a>>;

/// An alternate execution strategy (e.g. hosting the loop in a
/// durable-execution engine). When set on an [`AgentEngine`], `execute`
/// delegates to it.
pub trait Runtime: Send + Sync {
    fn run(&self, agent: Arc<Agent>, input: AgentInput, cancel: CancellationToken) -> RunFuture<'_>;
}
