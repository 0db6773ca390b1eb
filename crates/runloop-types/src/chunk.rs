//! Streaming chunk types.
//!
//! `Chunk` is the unit that flows from a provider stream through the
//! accumulator to the caller's sink and the stream broker. Model-output
//! chunks and run lifecycle chunks share the same enum so that a single
//! ordered channel carries both.

use serde::{Deserialize, Serialize};

use crate::agent::AgentStatus;
use crate::llm::Usage;
use crate::message::FunctionCallMessage;

/// One content part of a completed assistant message item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputContent {
    OutputText { text: String },
    Refusal { refusal: String },
}

/// One part of a reasoning summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningSummaryPart {
    pub text: String,
}

/// An output item as reported by the provider once it is complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Message {
        id: String,
        #[serde(default)]
        content: Vec<OutputContent>,
    },
    Reasoning {
        id: String,
        #[serde(default)]
        summary: Vec<ReasoningSummaryPart>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encrypted_content: Option<String>,
    },
    FunctionCall {
        id: String,
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought_signature: Option<String>,
    },
    ImageGenerationCall {
        id: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
}

/// Payload of every run lifecycle chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: String,
    pub status: AgentStatus,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tool_calls: Option<Vec<FunctionCallMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A streamed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Chunk {
    #[serde(rename = "response.created")]
    ResponseCreated { response_id: String },

    #[serde(rename = "response.in_progress")]
    ResponseInProgress { response_id: String },

    #[serde(rename = "response.output_item.added")]
    OutputItemAdded { output_index: u32, item: OutputItem },

    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta {
        item_id: String,
        output_index: u32,
        content_index: u32,
        delta: String,
    },

    #[serde(rename = "response.reasoning_summary_text.delta")]
    ReasoningSummaryTextDelta {
        item_id: String,
        output_index: u32,
        delta: String,
    },

    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        item_id: String,
        output_index: u32,
        delta: String,
    },

    #[serde(rename = "response.output_item.done")]
    OutputItemDone { output_index: u32, item: OutputItem },

    #[serde(rename = "response.completed")]
    ResponseCompleted { response_id: String, usage: Usage },

    #[serde(rename = "run.created")]
    RunCreated(RunEvent),

    #[serde(rename = "run.in_progress")]
    RunInProgress(RunEvent),

    #[serde(rename = "run.paused")]
    RunPaused(RunEvent),

    #[serde(rename = "run.completed")]
    RunCompleted(RunEvent),

    #[serde(rename = "run.failed")]
    RunFailed(RunEvent),
}

impl Chunk {
    /// The wire tag of this chunk.
    pub fn event_type(&self) -> &'static str {
        match self {
            Chunk::ResponseCreated { .. } => "response.created",
            Chunk::ResponseInProgress { .. } => "response.in_progress",
            Chunk::OutputItemAdded { .. } => "response.output_item.added",
            Chunk::OutputTextDelta { .. } => "response.output_text.delta",
            Chunk::ReasoningSummaryTextDelta { .. } => "response.reasoning_summary_text.delta",
            Chunk::FunctionCallArgumentsDelta { .. } => "response.function_call_arguments.delta",
            Chunk::OutputItemDone { .. } => "response.output_item.done",
            Chunk::ResponseCompleted { .. } => "response.completed",
            Chunk::RunCreated(_) => "run.created",
            Chunk::RunInProgress(_) => "run.in_progress",
            Chunk::RunPaused(_) => "run.paused",
            Chunk::RunCompleted(_) => "run.completed",
            Chunk::RunFailed(_) => "run.failed",
        }
    }

    /// The lifecycle payload, for `run.*` chunks.
    pub fn run_event(&self) -> Option<&RunEvent> {
        match self {
            Chunk::RunCreated(e)
            | Chunk::RunInProgress(e)
            | Chunk::RunPaused(e)
            | Chunk::RunCompleted(e)
            | Chunk::RunFailed(e) => Some(e),
            _ => None,
        }
    }

    /// Whether this chunk ends a run's stream (completed, paused or failed).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Chunk::RunCompleted(_) | Chunk::RunPaused(_) | Chunk::RunFailed(_)
        )
    }
}
