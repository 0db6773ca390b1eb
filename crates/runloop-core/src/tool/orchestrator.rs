//! Tool-call orchestration: approval partitioning, execution, and handoffs.
//!
//! The engine drives the sequencing (immediate calls first, then gated ones
//! are parked for approval). This module decides what a single call resolves
//! to: a tool's output, a declined output, or a transfer to another agent.

use std::sync::Arc;

use runloop_types::conversation::new_id;
use runloop_types::llm::ToolDefinition;
use runloop_types::message::{
    DECLINED_TOOL_OUTPUT, FunctionCallMessage, FunctionCallOutputMessage,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::agent::definition::{Agent, Handoff};
use crate::agent::error::AgentError;

use super::{BoxTool, ToolContext};

/// Name of the synthetic tool that transfers the conversation to another agent.
pub const TRANSFER_TO_AGENT: &str = "transfer_to_agent";

/// A pending switch to another agent, applied once every result of the
/// current turn has been appended.
#[derive(Debug, Clone)]
pub struct HandoffContinuation {
    /// Handoff name, as persisted when the run pauses before the switch.
    pub name: String,
    pub target: Arc<Agent>,
}

/// Resolution of one tool call.
#[derive(Debug)]
pub struct CallOutcome {
    pub output: FunctionCallOutputMessage,
    pub handoff: Option<HandoffContinuation>,
}

#[derive(Debug, Deserialize)]
struct TransferArgs {
    agent_name: String,
}

/// Split calls into `(needs_approval, immediate)`, preserving proposal order
/// within each list.
///
/// Calls naming an unknown tool are immediate; they fail when executed.
pub fn partition_by_approval(
    tools: &[BoxTool],
    calls: Vec<FunctionCallMessage>,
) -> (Vec<FunctionCallMessage>, Vec<FunctionCallMessage>) {
    calls.into_iter().partition(|call| {
        tools
            .iter()
            .find(|t| t.name() == call.name)
            .is_some_and(|t| t.needs_approval())
    })
}

/// Definition of `transfer_to_agent` listing the available targets.
pub fn transfer_tool_definition(handoffs: &[Handoff]) -> ToolDefinition {
    let targets: Vec<String> = handoffs
        .iter()
        .map(|h| format!("- {}: {}", h.name, h.description))
        .collect();
    let names: Vec<&str> = handoffs.iter().map(|h| h.name.as_str()).collect();

    ToolDefinition {
        name: TRANSFER_TO_AGENT.to_string(),
        description: format!(
            "Transfer the conversation to another agent. Available agents:\n{}",
            targets.join("\n")
        ),
        parameters: json!({
            "type": "object",
            "properties": {
                "agent_name": {
                    "type": "string",
                    "enum": names,
                    "description": "Name of the agent to transfer to",
                }
            },
            "required": ["agent_name"],
            "additionalProperties": false,
        }),
    }
}

/// The fixed output for a call the user declined.
pub fn decline(call: &FunctionCallMessage) -> FunctionCallOutputMessage {
    FunctionCallOutputMessage {
        id: new_id("fco"),
        call_id: call.call_id.clone(),
        output: DECLINED_TOOL_OUTPUT.to_string(),
    }
}

/// Resolve one call against `agent`: execute its tool or perform a transfer.
pub async fn execute_call(
    agent: &Agent,
    call: &FunctionCallMessage,
    ctx: &ToolContext,
) -> Result<CallOutcome, AgentError> {
    if call.name == TRANSFER_TO_AGENT {
        return resolve_transfer(agent, call);
    }

    let tool = agent
        .find_tool(&call.name)
        .ok_or_else(|| AgentError::UnknownTool(call.name.clone()))?;

    debug!(
        tool = %call.name,
        call_id = %call.call_id,
        run_id = %ctx.run_id,
        "executing tool"
    );
    let mut output = tool.execute(call, ctx).await?;
    if output.call_id != call.call_id {
        warn!(
            tool = %call.name,
            expected = %call.call_id,
            actual = %output.call_id,
            "tool returned mismatched call_id, correcting"
        );
        output.call_id = call.call_id.clone();
    }

    Ok(CallOutcome {
        output,
        handoff: None,
    })
}

fn resolve_transfer(
    agent: &Agent,
    call: &FunctionCallMessage,
) -> Result<CallOutcome, AgentError> {
    let args: TransferArgs =
        serde_json::from_str(&call.arguments).map_err(|e| AgentError::InvalidToolArguments {
            tool: call.name.clone(),
            message: e.to_string(),
        })?;

    let (text, handoff) = match agent.find_handoff(&args.agent_name) {
        Some(handoff) => {
            info!(from = %agent.name, to = %handoff.name, "handoff requested");
            (
                format!("Transferred to agent {}", handoff.name),
                Some(HandoffContinuation {
                    name: handoff.name.clone(),
                    target: Arc::clone(&handoff.target),
                }),
            )
        }
        None => {
            warn!(from = %agent.name, target = %args.agent_name, "handoff target not found");
            (
                format!(
                    "Transfer failed: no agent named '{}' is available",
                    args.agent_name
                ),
                None,
            )
        }
    };

    Ok(CallOutcome {
        output: FunctionCallOutputMessage {
            id: new_id("fco"),
            call_id: call.call_id.clone(),
            output: text,
        },
        handoff,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingTool, ScriptedLlm, function_call};

    fn agent_with_tools() -> (Agent, RecordingTool, RecordingTool) {
        let search = RecordingTool::new("search", false);
        let delete = RecordingTool::new("delete_file", true);
        let agent = Agent::new("main", "test-model", Arc::new(ScriptedLlm::new(vec![])))
            .with_tool(BoxTool::new(search.clone()))
            .with_tool(BoxTool::new(delete.clone()));
        (agent, search, delete)
    }

    fn ctx() -> ToolContext {
        ToolContext {
            namespace: "ns".to_string(),
            run_id: "msg_run".to_string(),
            run_context: Default::default(),
        }
    }

    #[test]
    fn test_partition_by_approval_preserves_order() {
        let (agent, _, _) = agent_with_tools();
        let calls = vec![
            function_call("1", "delete_file", "{}"),
            function_call("2", "search", "{}"),
            function_call("3", "mystery", "{}"),
            function_call("4", "delete_file", "{}"),
        ];
        let (gated, immediate) = partition_by_approval(&agent.tools, calls);
        let gated: Vec<_> = gated.iter().map(|c| c.call_id.as_str()).collect();
        let immediate: Vec<_> = immediate.iter().map(|c| c.call_id.as_str()).collect();
        assert_eq!(gated, vec!["1", "4"]);
        assert_eq!(immediate, vec!["2", "3"]);
    }

    #[tokio::test]
    async fn test_execute_call_runs_tool() {
        let (agent, search, _) = agent_with_tools();
        let call = function_call("c1", "search", r#"{"q":"rust"}"#);
        let outcome = execute_call(&agent, &call, &ctx()).await.unwrap();
        assert_eq!(outcome.output.call_id, "c1");
        assert!(outcome.handoff.is_none());
        assert_eq!(search.calls(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_an_error() {
        let (agent, _, _) = agent_with_tools();
        let call = function_call("c1", "mystery", "{}");
        let err = execute_call(&agent, &call, &ctx()).await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownTool(name) if name == "mystery"));
    }

    #[test]
    fn test_decline_uses_fixed_output() {
        let call = function_call("c9", "delete_file", "{}");
        let output = decline(&call);
        assert_eq!(output.call_id, "c9");
        assert_eq!(output.output, DECLINED_TOOL_OUTPUT);
    }

    #[tokio::test]
    async fn test_transfer_resolves_handoff() {
        let billing = Arc::new(
            Agent::new("billing", "test-model", Arc::new(ScriptedLlm::new(vec![])))
                .with_description("Handles invoices"),
        );
        let (agent, _, _) = agent_with_tools();
        let agent = agent.with_handoff(Handoff::new(billing));

        let call = function_call("t1", TRANSFER_TO_AGENT, r#"{"agent_name":"billing"}"#);
        let outcome = execute_call(&agent, &call, &ctx()).await.unwrap();
        assert_eq!(outcome.output.output, "Transferred to agent billing");
        let handoff = outcome.handoff.unwrap();
        assert_eq!(handoff.name, "billing");
        assert_eq!(handoff.target.name, "billing");

        let call = function_call("t2", TRANSFER_TO_AGENT, r#"{"agent_name":"legal"}"#);
        let outcome = execute_call(&agent, &call, &ctx()).await.unwrap();
        assert!(outcome.output.output.starts_with("Transfer failed"));
        assert!(outcome.handoff.is_none());

        let call = function_call("t3", TRANSFER_TO_AGENT, "not json");
        let err = execute_call(&agent, &call, &ctx()).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidToolArguments { .. }));
    }

    #[tokio::test]
    async fn test_transfer_without_handoffs_fails_softly() {
        let (agent, _, _) = agent_with_tools();
        let call = function_call("t1", TRANSFER_TO_AGENT, r#"{"agent_name":"billing"}"#);
        let outcome = execute_call(&agent, &call, &ctx()).await.unwrap();
        assert_eq!(outcome.output.call_id, "t1");
        assert!(outcome.output.output.starts_with("Transfer failed"));
        assert!(outcome.handoff.is_none());
    }

    #[test]
    fn test_transfer_definition_lists_targets() {
        let billing = Arc::new(
            Agent::new("billing", "m", Arc::new(ScriptedLlm::new(vec![])))
                .with_description("Handles invoices"),
        );
        let def = transfer_tool_definition(&[Handoff::new(billing)]);
        assert_eq!(def.name, TRANSFER_TO_AGENT);
        assert!(def.description.contains("billing: Handles invoices"));
        assert_eq!(def.parameters["properties"]["agent_name"]["enum"][0], "billing");
    }
}
