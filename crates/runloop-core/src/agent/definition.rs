//! Agent definitions: model, instruction, tools and handoffs.

use std::sync::Arc;

use runloop_types::llm::ToolDefinition;
use runloop_types::message::RunContext;
use serde_json::Value;

use crate::llm::LlmProvider;
use crate::tool::BoxTool;

/// Produces the system prompt for a run from its context.
pub trait SystemPromptProvider: Send + Sync {
    fn system_prompt(&self, run_context: &RunContext) -> String;
}

/// How an agent's instruction is obtained.
#[derive(Clone)]
pub enum Instruction {
    /// Used verbatim.
    Static(String),
    /// `{{key}}` placeholders are replaced with values from the run context.
    /// String values are inserted as-is, other values as JSON. Unknown keys
    /// are left untouched.
    Template(String),
    /// Computed by a collaborator.
    Provider(Arc<dyn SystemPromptProvider>),
}

impl Instruction {
    pub fn render(&self, run_context: &RunContext) -> String {
        match self {
            Instruction::Static(text) => text.clone(),
            Instruction::Template(template) => render_template(template, run_context),
            Instruction::Provider(provider) => provider.system_prompt(run_context),
        }
    }
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::Static(text) => f.debug_tuple("Static").field(text).finish(),
            Instruction::Template(text) => f.debug_tuple("Template").field(text).finish(),
            Instruction::Provider(_) => f.write_str("Provider(..)"),
        }
    }
}

fn render_template(template: &str, run_context: &RunContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = after[..end].trim();
        match run_context.get(key) {
            Some(Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

/// A transfer target offered to the model through `transfer_to_agent`.
#[derive(Debug, Clone)]
pub struct Handoff {
    pub name: String,
    pub description: String,
    pub target: Arc<Agent>,
}

impl Handoff {
    pub fn new(target: Arc<Agent>) -> Self {
        Self {
            name: target.name.clone(),
            description: target.description.clone(),
            target,
        }
    }
}

/// An agent: one model, one instruction, a tool set and optional handoffs.
#[derive(Clone)]
pub struct Agent {
    pub name: String,
    pub description: String,
    pub model: String,
    pub instruction: Instruction,
    pub tools: Vec<BoxTool>,
    pub handoffs: Vec<Handoff>,
    pub provider: Arc<dyn LlmProvider>,
    pub temperature: Option<f64>,
    pub max_output_tokens: Option<u32>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            model: model.into(),
            instruction: Instruction::Static(String::new()),
            tools: Vec::new(),
            handoffs: Vec::new(),
            provider,
            temperature: None,
            max_output_tokens: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instruction(mut self, instruction: Instruction) -> Self {
        self.instruction = instruction;
        self
    }

    pub fn with_tool(mut self, tool: BoxTool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_handoff(mut self, handoff: Handoff) -> Self {
        self.handoffs.push(handoff);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn find_tool(&self, name: &str) -> Option<&BoxTool> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn find_handoff(&self, agent_name: &str) -> Option<&Handoff> {
        self.handoffs.iter().find(|h| h.name == agent_name)
    }

    /// Tool definitions offered to the model, including `transfer_to_agent`
    /// when the agent has handoffs.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.iter().map(|t| t.definition()).collect();
        if !self.handoffs.is_empty() {
            defs.push(crate::tool::orchestrator::transfer_tool_definition(&self.handoffs));
        }
        defs
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("provider", &self.provider.name())
            .field("tools", &self.tools)
            .field(
                "handoffs",
                &self.handoffs.iter().map(|h| h.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
