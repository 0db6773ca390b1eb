use runloop_types::error::RepositoryError;
use runloop_types::llm::LlmError;
use runloop_types::run::RunStateError;
use thiserror::Error;

use crate::conversation::run_manager::RunManagerError;
use crate::tool::ToolError;

/// Terminal errors of an `execute` call.
///
/// Input errors (`InvalidResumeInput`, `UnknownTool`, `InvalidToolArguments`)
/// and collaborator errors leave the run at its last checkpoint.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid resume input: {0}")]
    InvalidResumeInput(String),

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid arguments for tool '{tool}': {message}")]
    InvalidToolArguments { tool: String, message: String },

    #[error("persistence error: {0}")]
    Persistence(#[from] RepositoryError),

    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("run exceeded the maximum of {max_loops} loops")]
    MaxLoopsExceeded { max_loops: u32 },

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    InvalidTransition(#[from] RunStateError),
}

impl From<RunManagerError> for AgentError {
    fn from(err: RunManagerError) -> Self {
        match err {
            RunManagerError::Persistence(e) => AgentError::Persistence(e),
            RunManagerError::InvalidResumeInput(msg) => AgentError::InvalidResumeInput(msg),
            RunManagerError::InvalidTransition(e) => AgentError::InvalidTransition(e),
            RunManagerError::Serialization(msg) => {
                AgentError::Persistence(RepositoryError::Query(msg))
            }
        }
    }
}
