//! In-memory conversation store.
//!
//! Keeps records, threads and summaries per namespace in a `DashMap`. Each
//! namespace entry is locked for the duration of one operation, so writes to
//! distinct namespaces never contend.

use std::collections::HashMap;

use chrono::Utc;
use dashmap::DashMap;
use runloop_core::repository::ConversationPersistence;
use runloop_types::conversation::{ConversationChain, ConversationMessage, Summary, new_id};
use runloop_types::error::RepositoryError;
use runloop_types::message::{Message, Meta};
use tracing::debug;

/// A linear path through a conversation. The last id is the tip.
#[derive(Debug, Clone)]
struct Thread {
    message_ids: Vec<String>,
}

impl Thread {
    fn position(&self, message_id: &str) -> Option<usize> {
        self.message_ids.iter().position(|id| id == message_id)
    }

    fn tip(&self) -> Option<&str> {
        self.message_ids.last().map(String::as_str)
    }
}

#[derive(Debug, Default)]
struct Namespace {
    records: HashMap<String, ConversationMessage>,
    threads: HashMap<String, Thread>,
    summaries: HashMap<String, Summary>,
}

impl Namespace {
    /// Home thread of `message_id` and the record's position in it.
    fn locate(&self, message_id: &str) -> Option<(&str, &Thread, usize)> {
        let record = self.records.get(message_id)?;
        let thread = self.threads.get(&record.thread_id)?;
        let position = thread.position(message_id)?;
        Some((record.thread_id.as_str(), thread, position))
    }

    /// Thread the new record `message_id` goes to, forking when `previous`
    /// is not the tip of its thread.
    fn thread_for_new_record(
        &mut self,
        message_id: &str,
        previous: Option<&str>,
    ) -> Result<String, RepositoryError> {
        let Some(previous) = previous else {
            let thread_id = new_id("thread");
            self.threads.insert(
                thread_id.clone(),
                Thread {
                    message_ids: vec![message_id.to_string()],
                },
            );
            return Ok(thread_id);
        };

        let (parent_id, parent, position) = self
            .locate(previous)
            .ok_or(RepositoryError::NotFound)?;
        let parent_id = parent_id.to_string();

        if parent.tip() == Some(previous) {
            if let Some(thread) = self.threads.get_mut(&parent_id) {
                thread.message_ids.push(message_id.to_string());
            }
            return Ok(parent_id);
        }

        let mut message_ids = parent.message_ids[..=position].to_vec();
        message_ids.push(message_id.to_string());

        let inherited = self.summaries.get(&parent_id).and_then(|summary| {
            message_ids[..=position]
                .contains(&summary.last_summarized_message_id)
                .then(|| summary.clone())
        });

        let thread_id = new_id("thread");
        debug!(parent = %parent_id, thread_id = %thread_id, at = previous, "forking thread");
        self.threads.insert(thread_id.clone(), Thread { message_ids });
        if let Some(summary) = inherited {
            self.summaries.insert(
                thread_id.clone(),
                Summary {
                    id: new_id("sum"),
                    thread_id: thread_id.clone(),
                    ..summary
                },
            );
        }
        Ok(thread_id)
    }
}

/// `ConversationPersistence` backed by process memory.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    namespaces: DashMap<String, Namespace>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message ids of `thread_id`, oldest first.
    pub fn thread(&self, namespace: &str, thread_id: &str) -> Option<Vec<String>> {
        self.namespaces
            .get(namespace)?
            .threads
            .get(thread_id)
            .map(|t| t.message_ids.clone())
    }

    pub fn record(&self, namespace: &str, message_id: &str) -> Option<ConversationMessage> {
        self.namespaces.get(namespace)?.records.get(message_id).cloned()
    }
}

impl ConversationPersistence for InMemoryConversationStore {
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
        let Some(cursor) = previous_message_id else {
            return Ok(ConversationChain::default());
        };
        let Some(ns) = self.namespaces.get(namespace) else {
            return Ok(ConversationChain::default());
        };
        let Some((thread_id, thread, position)) = ns.locate(cursor) else {
            return Ok(ConversationChain::default());
        };

        let summary = ns.summaries.get(thread_id).and_then(|summary| {
            thread
                .position(&summary.last_summarized_message_id)
                .filter(|boundary| *boundary < position)
                .map(|boundary| (boundary, summary.clone()))
        });
        let start = summary.as_ref().map_or(0, |(boundary, _)| boundary + 1);

        let records = thread.message_ids[start..=position]
            .iter()
            .map(|id| {
                ns.records.get(id).cloned().ok_or_else(|| {
                    RepositoryError::Query(format!("thread references missing record {id}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ConversationChain {
            records,
            summary: summary.map(|(_, s)| s),
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
        let mut ns = self.namespaces.entry(namespace.to_string()).or_default();

        if let Some(record) = ns.records.get_mut(message_id) {
            let replay = record.messages.ends_with(messages) && &record.meta == meta;
            if !replay {
                record.messages.extend_from_slice(messages);
                record.meta = meta.clone();
            }
            return Ok(record.thread_id.clone());
        }

        let thread_id = ns.thread_for_new_record(message_id, previous_message_id)?;
        ns.records.insert(
            message_id.to_string(),
            ConversationMessage {
                message_id: message_id.to_string(),
                thread_id: thread_id.clone(),
                conversation_id: conversation_id.to_string(),
                previous_message_id: previous_message_id.map(str::to_string),
                messages: messages.to_vec(),
                meta: meta.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(thread_id)
    }

    async fn save_summary(&self, namespace: &str, summary: &Summary) -> Result<(), RepositoryError> {
        let mut ns = self.namespaces.entry(namespace.to_string()).or_default();
        if !ns.threads.contains_key(&summary.thread_id) {
            return Err(RepositoryError::NotFound);
        }
        ns.summaries.insert(summary.thread_id.clone(), summary.clone());
        Ok(())
    }
}
