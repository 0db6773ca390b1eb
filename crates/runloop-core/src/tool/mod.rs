//! Tool trait definition and tool-call orchestration.

pub mod box_tool;
pub mod orchestrator;

use runloop_types::llm::ToolDefinition;
use runloop_types::message::{FunctionCallMessage, FunctionCallOutputMessage, RunContext};
use thiserror::Error;

pub use box_tool::BoxTool;

/// Errors raised by tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments for tool '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("tool '{tool}' failed: {message}")]
    Execution { tool: String, message: String },

    #[error("journal error: {0}")]
    Journal(String),
}

/// Per-call context handed to tools.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub namespace: String,
    pub run_id: String,
    pub run_context: RunContext,
}

/// Trait for tools the model can call.
///
/// Uses native async fn in traits (RPITIT). Wrap implementations in
/// [`BoxTool`] to store heterogeneous tools on an agent.
pub trait Tool: Send + Sync {
    /// Name, description and argument schema offered to the model.
    fn definition(&self) -> ToolDefinition;

    /// Whether calls to this tool must be approved before they run.
    fn needs_approval(&self) -> bool {
        false
    }

    /// Execute one call. The returned output must carry `call.call_id`.
    fn execute(
        &self,
        call: &FunctionCallMessage,
        ctx: &ToolContext,
    ) -> impl std::future::Future<Output = Result<FunctionCallOutputMessage, ToolError>> + Send;
}
