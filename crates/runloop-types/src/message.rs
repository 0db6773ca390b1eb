//! Conversation message types for runloop.
//!
//! A `Message` is exactly one of a closed set of shapes, discriminated by an
//! explicit `type` tag. The run manager and accumulator only ever see these
//! already-tagged variants; provider-specific wire formats are translated
//! elsewhere.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Free-form metadata attached to persisted records.
pub type Meta = serde_json::Map<String, Value>;

/// Caller-supplied variables visible to instructions and tools for one run.
pub type RunContext = BTreeMap<String, Value>;

/// Fixed output recorded for a tool call the user declined.
pub const DECLINED_TOOL_OUTPUT: &str = "Request to call this tool has been declined";

/// Role of a plain conversational message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Developer,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::Developer => write!(f, "developer"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(Role::System),
            "developer" => Ok(Role::Developer),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("invalid message role: '{other}'")),
        }
    }
}

/// A plain role + text message, typically caller input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EasyMessage {
    pub role: Role,
    pub content: String,
}

/// Assistant text produced by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputMessage {
    pub id: String,
    pub content: String,
}

/// A tool call proposed by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallMessage {
    pub id: String,
    pub call_id: String,
    pub name: String,
    /// JSON-encoded arguments, exactly as produced by the model.
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

/// The result of executing (or declining) one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallOutputMessage {
    pub id: String,
    pub call_id: String,
    pub output: String,
}

/// Model reasoning, kept so it can be replayed to providers that require it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningMessage {
    pub id: String,
    #[serde(default)]
    pub summary: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_content: Option<String>,
}

/// An image generated by a hosted image-generation tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageGenerationCallMessage {
    pub id: String,
    pub status: String,
    /// Base64-encoded image payload.
    pub result: String,
}

/// The caller's verdict on tool calls that were held for approval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallApprovalResponseMessage {
    #[serde(default)]
    pub approved_call_ids: Vec<String>,
    #[serde(default)]
    pub rejected_call_ids: Vec<String>,
}

/// One entry of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    #[serde(rename = "message")]
    Easy(EasyMessage),
    #[serde(rename = "output_message")]
    Output(OutputMessage),
    FunctionCall(FunctionCallMessage),
    FunctionCallOutput(FunctionCallOutputMessage),
    Reasoning(ReasoningMessage),
    ImageGenerationCall(ImageGenerationCallMessage),
    FunctionCallApprovalResponse(FunctionCallApprovalResponseMessage),
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Message::Easy(EasyMessage {
            role: Role::User,
            content: content.into(),
        })
    }

    pub fn system(content: impl Into<String>) -> Self {
        Message::Easy(EasyMessage {
            role: Role::System,
            content: content.into(),
        })
    }

    pub fn assistant(id: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Output(OutputMessage {
            id: id.into(),
            content: content.into(),
        })
    }

    pub fn function_call_output(
        id: impl Into<String>,
        call_id: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Message::FunctionCallOutput(FunctionCallOutputMessage {
            id: id.into(),
            call_id: call_id.into(),
            output: output.into(),
        })
    }

    /// The tool call carried by this message, if it is one.
    pub fn as_function_call(&self) -> Option<&FunctionCallMessage> {
        match self {
            Message::FunctionCall(call) => Some(call),
            _ => None,
        }
    }

    /// Short type label used in logs and CLI tables.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Easy(_) => "message",
            Message::Output(_) => "output_message",
            Message::FunctionCall(_) => "function_call",
            Message::FunctionCallOutput(_) => "function_call_output",
            Message::Reasoning(_) => "reasoning",
            Message::ImageGenerationCall(_) => "image_generation_call",
            Message::FunctionCallApprovalResponse(_) => "function_call_approval_response",
        }
    }

    /// Human-readable one-line rendering (used for summarization prompts and CLI output).
    pub fn to_text(&self) -> String {
        match self {
            Message::Easy(m) => format!("{}: {}", m.role, m.content),
            Message::Output(m) => format!("assistant: {}", m.content),
            Message::FunctionCall(c) => format!("tool call {}({})", c.name, c.arguments),
            Message::FunctionCallOutput(o) => format!("tool result [{}]: {}", o.call_id, o.output),
            Message::Reasoning(r) => format!("reasoning: {}", r.summary.join(" ")),
            Message::ImageGenerationCall(i) => format!("image generation [{}]", i.status),
            Message::FunctionCallApprovalResponse(a) => format!(
                "approval: approved={:?} rejected={:?}",
                a.approved_call_ids, a.rejected_call_ids
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrip() {
        for role in [Role::System, Role::Developer, Role::User, Role::Assistant] {
            let parsed: Role = role.to_string().parse().unwrap();
            assert_eq!(role, parsed);
        }
    }

    #[test]
    fn test_easy_message_tag() {
        let json = serde_json::to_value(Message::user("Hello!")).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "Hello!");
    }

    #[test]
    fn test_function_call_omits_missing_signature() {
        let msg = Message::FunctionCall(FunctionCallMessage {
            id: "fc_1".to_string(),
            call_id: "call_1".to_string(),
            name: "delete_file".to_string(),
            arguments: r#"{"path":"/tmp/x"}"#.to_string(),
            thought_signature: None,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"function_call\""));
        assert!(!json.contains("thought_signature"));
    }

    #[test]
    fn test_approval_response_defaults() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"function_call_approval_response","approved_call_ids":["a"]}"#)
                .unwrap();
        match msg {
            Message::FunctionCallApprovalResponse(resp) => {
                assert_eq!(resp.approved_call_ids, vec!["a".to_string()]);
                assert!(resp.rejected_call_ids.is_empty());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let result: Result<Message, _> = serde_json::from_str(r#"{"type":"mystery"}"#);
        assert!(result.is_err());
    }
}
