//! Agent run outcome types.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::message::{FunctionCallMessage, Message};

/// Externally visible status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    InProgress,
    Paused,
    Completed,
    Error,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::InProgress => write!(f, "in_progress"),
            AgentStatus::Paused => write!(f, "paused"),
            AgentStatus::Completed => write!(f, "completed"),
            AgentStatus::Error => write!(f, "error"),
        }
    }
}

/// Result of one `execute` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    /// The run (message record) id the caller passes back to continue.
    pub run_id: String,
    pub status: AgentStatus,
    /// Messages produced during this call, in history order.
    pub output: Vec<Message>,
    /// Tool calls waiting for a verdict when `status` is `Paused`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_approvals: Vec<FunctionCallMessage>,
}

impl AgentOutput {
    /// The text of the last assistant message, if any.
    pub fn final_text(&self) -> Option<&str> {
        self.output.iter().rev().find_map(|m| match m {
            Message::Output(out) => Some(out.content.as_str()),
            _ => None,
        })
    }
}
