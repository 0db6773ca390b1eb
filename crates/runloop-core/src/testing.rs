//! Test doubles shared by the core test modules.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use runloop_types::chunk::{Chunk, OutputContent, OutputItem};
use runloop_types::conversation::{ConversationChain, ConversationMessage, Summary, new_id};
use runloop_types::error::RepositoryError;
use runloop_types::llm::{LlmError, LlmRequest, ToolDefinition, Usage};
use runloop_types::message::{FunctionCallMessage, FunctionCallOutputMessage, Message, Meta};
use serde_json::json;

use crate::llm::{ChunkStream, LlmProvider};
use crate::repository::ConversationPersistence;
use crate::tool::{Tool, ToolContext, ToolError};

pub fn function_call(call_id: &str, name: &str, arguments: &str) -> FunctionCallMessage {
    FunctionCallMessage {
        id: format!("fc_{call_id}"),
        call_id: call_id.to_string(),
        name: name.to_string(),
        arguments: arguments.to_string(),
        thought_signature: None,
    }
}

/// A response that streams `text` and completes with 10/5 tokens.
pub fn text_turn(text: &str) -> Vec<Chunk> {
    let item_id = new_id("msg");
    vec![
        Chunk::ResponseCreated {
            response_id: "resp".to_string(),
        },
        Chunk::OutputTextDelta {
            item_id: item_id.clone(),
            output_index: 0,
            content_index: 0,
            delta: text.to_string(),
        },
        Chunk::OutputItemDone {
            output_index: 0,
            item: OutputItem::Message {
                id: item_id,
                content: vec![OutputContent::OutputText {
                    text: text.to_string(),
                }],
            },
        },
        Chunk::ResponseCompleted {
            response_id: "resp".to_string(),
            usage: Usage::new(10, 5),
        },
    ]
}

/// A response proposing `(call_id, name, arguments)` tool calls.
pub fn tool_call_turn(calls: &[(&str, &str, &str)]) -> Vec<Chunk> {
    let mut chunks = vec![Chunk::ResponseCreated {
        response_id: "resp".to_string(),
    }];
    for (index, (call_id, name, arguments)) in calls.iter().enumerate() {
        chunks.push(Chunk::FunctionCallArgumentsDelta {
            item_id: format!("fc_{call_id}"),
            output_index: index as u32,
            delta: arguments.to_string(),
        });
        chunks.push(Chunk::OutputItemDone {
            output_index: index as u32,
            item: OutputItem::FunctionCall {
                id: format!("fc_{call_id}"),
                call_id: call_id.to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
                thought_signature: None,
            },
        });
    }
    chunks.push(Chunk::ResponseCompleted {
        response_id: "resp".to_string(),
        usage: Usage::new(10, 5),
    });
    chunks
}

// ---------------------------------------------------------------------------
// Scripted LLM
// ---------------------------------------------------------------------------

/// Replays scripted turns in order, recording every request.
#[derive(Default)]
pub struct ScriptedLlm {
    turns: Mutex<VecDeque<Vec<Chunk>>>,
    repeat: Option<Vec<Chunk>>,
    requests: Mutex<Vec<LlmRequest>>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(turns: Vec<Vec<Chunk>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            ..Default::default()
        }
    }

    /// Answers every call with the same turn.
    pub fn repeating(turn: Vec<Chunk>) -> Self {
        Self {
            repeat: Some(turn),
            ..Default::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    fn stream(&self, request: LlmRequest) -> ChunkStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.repeat.clone());
        match turn {
            Some(chunks) => Box::pin(futures_util::stream::iter(chunks.into_iter().map(Ok))),
            None => Box::pin(futures_util::stream::iter(vec![Err(LlmError::Provider {
                message: "script exhausted".to_string(),
            })])),
        }
    }
}

// ---------------------------------------------------------------------------
// Recording tool
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RecordingTool {
    name: String,
    needs_approval: bool,
    fail: bool,
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingTool {
    pub fn new(name: &str, needs_approval: bool) -> Self {
        Self {
            name: name.to_string(),
            needs_approval,
            fail: false,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name, false)
        }
    }

    /// Call ids executed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Tool for RecordingTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: format!("test tool {}", self.name),
            parameters: json!({"type": "object"}),
        }
    }

    fn needs_approval(&self) -> bool {
        self.needs_approval
    }

    async fn execute(
        &self,
        call: &FunctionCallMessage,
        _ctx: &ToolContext,
    ) -> Result<FunctionCallOutputMessage, ToolError> {
        self.calls.lock().unwrap().push(call.call_id.clone());
        if self.fail {
            return Err(ToolError::Execution {
                tool: self.name.clone(),
                message: "boom".to_string(),
            });
        }
        Ok(FunctionCallOutputMessage {
            id: new_id("fco"),
            call_id: call.call_id.clone(),
            output: format!("ok:{}", self.name),
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory persistence
// ---------------------------------------------------------------------------

/// Minimal store: records linked by `previous_message_id`, one summary per
/// conversation. Branching falls out of following the links.
#[derive(Default)]
pub struct MemoryPersistence {
    records: Mutex<HashMap<(String, String), ConversationMessage>>,
    summaries: Mutex<HashMap<(String, String), Summary>>,
    pub fail_saves: std::sync::atomic::AtomicBool,
}

impl MemoryPersistence {
    pub fn record(&self, namespace: &str, id: &str) -> Option<ConversationMessage> {
        self.records
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), id.to_string()))
            .cloned()
    }

    pub fn records(&self) -> Vec<ConversationMessage> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

impl ConversationPersistence for MemoryPersistence {
    async fn new_conversation_id(&self) -> Result<String, RepositoryError> {
        Ok(new_id("conv"))
    }

    async fn new_run_id(&self) -> Result<String, RepositoryError> {
        Ok(new_id("msg"))
    }

    async fn load_messages(
        &self,
        namespace: &str,
        previous_message_id: Option<&str>,
    ) -> Result<ConversationChain, RepositoryError> {
        let records = self.records.lock().unwrap();
        let mut chain = Vec::new();
        let mut cursor = previous_message_id.map(str::to_string);
        while let Some(id) = cursor {
            let Some(record) = records.get(&(namespace.to_string(), id)) else {
                break;
            };
            cursor = record.previous_message_id.clone();
            chain.push(record.clone());
        }
        chain.reverse();

        let summary = chain.first().and_then(|first| {
            self.summaries
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), first.thread_id.clone()))
                .cloned()
        });
        if let Some(summary) = summary {
            if let Some(pos) = chain
                .iter()
                .position(|r| r.message_id == summary.last_summarized_message_id)
            {
                if pos + 1 < chain.len() {
                    return Ok(ConversationChain {
                        records: chain.split_off(pos + 1),
                        summary: Some(summary),
                    });
                }
            }
        }
        Ok(ConversationChain {
            records: chain,
            summary: None,
        })
    }

    async fn save_messages(
        &self,
        namespace: &str,
        message_id: &str,
        previous_message_id: Option<&str>,
        conversation_id: &str,
        messages: &[Message],
        meta: &Meta,
    ) -> Result<String, RepositoryError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(RepositoryError::Query("save failed".to_string()));
        }
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry((namespace.to_string(), message_id.to_string()))
            .or_insert_with(|| ConversationMessage {
                message_id: message_id.to_string(),
                thread_id: format!("thread_{conversation_id}"),
                conversation_id: conversation_id.to_string(),
                previous_message_id: previous_message_id.map(str::to_string),
                messages: Vec::new(),
                meta: Meta::new(),
                created_at: Utc::now(),
            });
        if !(record.messages.ends_with(messages) && &record.meta == meta) {
            record.messages.extend_from_slice(messages);
        }
        record.meta = meta.clone();
        Ok(record.thread_id.clone())
    }

    async fn save_summary(&self, namespace: &str, summary: &Summary) -> Result<(), RepositoryError> {
        self.summaries.lock().unwrap().insert(
            (namespace.to_string(), summary.thread_id.clone()),
            summary.clone(),
        );
        Ok(())
    }
}
