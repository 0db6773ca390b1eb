//! Run state machine.
//!
//! A `RunState` is pure data plus guarded transition methods. It is
//! serialized into the metadata of every persisted message record so that a
//! run can be resumed (or replayed) from its last checkpoint.
//!
//! ```text
//! CallLlm ──► ExecuteTools ──► CallLlm
//!    │             │
//!    │             └──► AwaitApproval ──► ExecuteTools
//!    ├──► AwaitApproval
//!    └──► Complete
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::agent::AgentStatus;
use crate::llm::Usage;
use crate::message::FunctionCallMessage;

/// Metadata key under which the serialized run state is stored.
pub const RUN_STATE_META_KEY: &str = "run_state";

/// The step the engine executes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    CallLlm,
    ExecuteTools,
    AwaitApproval,
    Complete,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::CallLlm => write!(f, "call_llm"),
            Step::ExecuteTools => write!(f, "execute_tools"),
            Step::AwaitApproval => write!(f, "await_approval"),
            Step::Complete => write!(f, "complete"),
        }
    }
}

/// Status derived from the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Paused,
    Completed,
}

impl From<RunStatus> for AgentStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::InProgress => AgentStatus::InProgress,
            RunStatus::Paused => AgentStatus::Paused,
            RunStatus::Completed => AgentStatus::Completed,
        }
    }
}

/// Attempted a transition the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunStateError {
    #[error("invalid run state transition from {from} to {to}")]
    InvalidTransition { from: Step, to: Step },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub current_step: Step,
    pub loop_iteration: u32,
    #[serde(default)]
    pub usage: Usage,
    /// Calls to execute (in `ExecuteTools`) or awaiting a verdict (in `AwaitApproval`).
    #[serde(default)]
    pub pending_tool_calls: Vec<FunctionCallMessage>,
    /// Gated calls parked while immediate calls of the same turn execute.
    #[serde(default)]
    pub tools_awaiting_approval: Vec<FunctionCallMessage>,
    /// Handoff chosen in a turn that paused before it could take effect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_handoff: Option<String>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            current_step: Step::CallLlm,
            loop_iteration: 0,
            usage: Usage::default(),
            pending_tool_calls: Vec::new(),
            tools_awaiting_approval: Vec::new(),
            pending_handoff: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self.current_step {
            Step::CallLlm | Step::ExecuteTools => RunStatus::InProgress,
            Step::AwaitApproval => RunStatus::Paused,
            Step::Complete => RunStatus::Completed,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.current_step == Step::Complete
    }

    fn guard(&self, to: Step, allowed: &[Step]) -> Result<(), RunStateError> {
        if allowed.contains(&self.current_step) {
            Ok(())
        } else {
            Err(RunStateError::InvalidTransition {
                from: self.current_step,
                to,
            })
        }
    }

    /// Enter a new loop pass. Increments `loop_iteration`.
    pub fn transition_to_llm(&mut self) -> Result<(), RunStateError> {
        self.guard(Step::CallLlm, &[Step::CallLlm, Step::ExecuteTools])?;
        self.current_step = Step::CallLlm;
        self.loop_iteration += 1;
        Ok(())
    }

    pub fn transition_to_execute_tools(
        &mut self,
        calls: Vec<FunctionCallMessage>,
    ) -> Result<(), RunStateError> {
        self.guard(Step::ExecuteTools, &[Step::CallLlm])?;
        self.current_step = Step::ExecuteTools;
        self.pending_tool_calls = calls;
        Ok(())
    }

    pub fn transition_to_await_approval(
        &mut self,
        calls: Vec<FunctionCallMessage>,
    ) -> Result<(), RunStateError> {
        self.guard(Step::AwaitApproval, &[Step::CallLlm, Step::ExecuteTools])?;
        self.current_step = Step::AwaitApproval;
        self.pending_tool_calls = calls;
        self.tools_awaiting_approval.clear();
        Ok(())
    }

    pub fn transition_to_complete(&mut self) -> Result<(), RunStateError> {
        self.guard(Step::Complete, &[Step::CallLlm])?;
        self.current_step = Step::Complete;
        self.pending_tool_calls.clear();
        self.tools_awaiting_approval.clear();
        self.pending_handoff = None;
        Ok(())
    }

    /// Force `AwaitApproval -> ExecuteTools` when a verdict arrives.
    /// The pending calls are kept: they are the calls the verdict applies to.
    pub fn resume_from_approval(&mut self) -> Result<(), RunStateError> {
        self.guard(Step::ExecuteTools, &[Step::AwaitApproval])?;
        self.current_step = Step::ExecuteTools;
        Ok(())
    }

    pub fn clear_pending_tools(&mut self) {
        self.pending_tool_calls.clear();
    }

    /// Park gated calls while the immediate ones of the same turn run.
    pub fn defer_for_approval(&mut self, calls: Vec<FunctionCallMessage>) {
        self.tools_awaiting_approval.extend(calls);
    }

    /// Move parked calls into `pending_tool_calls` and pause.
    pub fn promote_awaiting_to_approval(&mut self) -> Result<(), RunStateError> {
        let awaiting = std::mem::take(&mut self.tools_awaiting_approval);
        self.transition_to_await_approval(awaiting)
    }

    pub fn has_awaiting_approval(&self) -> bool {
        !self.tools_awaiting_approval.is_empty()
    }

    pub fn add_usage(&mut self, usage: &Usage) {
        self.usage.add(usage);
    }
}
