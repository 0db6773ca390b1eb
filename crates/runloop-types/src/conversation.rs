//! Persisted conversation records.
//!
//! A conversation is a tree of message records. Each record holds the
//! messages of one run and links to its predecessor through
//! `previous_message_id`. A thread is a linear path through that tree; saving
//! after a non-tip record forks a new thread (copy-on-write).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{Message, Meta};
use crate::run::{RUN_STATE_META_KEY, RunState};

/// Generate a prefixed, time-sortable identifier (`"{prefix}_{uuid-v7}"`).
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::now_v7().simple())
}

/// One persisted run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub message_id: String,
    pub thread_id: String,
    pub conversation_id: String,
    pub previous_message_id: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub meta: Meta,
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    /// The run state checkpointed with this record, if any.
    ///
    /// Unparsable state is treated as absent so that a fresh run starts.
    pub fn run_state(&self) -> Option<RunState> {
        self.meta
            .get(RUN_STATE_META_KEY)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// A compacted prefix of a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub id: String,
    pub thread_id: String,
    pub summary_message: Message,
    /// The last record folded into this summary. Records up to and including
    /// it are replaced by `summary_message` when the chain is loaded.
    pub last_summarized_message_id: String,
    #[serde(default)]
    pub meta: Meta,
    pub created_at: DateTime<Utc>,
}

/// The result of loading a thread up to a cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationChain {
    /// Records after the summary boundary (or all records without a summary),
    /// oldest first. The last record is the cursor.
    pub records: Vec<ConversationMessage>,
    pub summary: Option<Summary>,
}

impl ConversationChain {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.summary.is_none()
    }

    pub fn last(&self) -> Option<&ConversationMessage> {
        self.records.last()
    }

    /// Conversation id of the chain, taken from its records.
    pub fn conversation_id(&self) -> Option<&str> {
        self.records.first().map(|r| r.conversation_id.as_str())
    }
}
