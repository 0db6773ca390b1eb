//! Conversation run manager.
//!
//! One `ConversationRunManager` exists per `execute` call. It owns the run's
//! message timeline: the history loaded from the store (grouped by run), the
//! messages added during this call, and the run state. `save_messages` is the
//! only checkpoint; nothing reaches the store between checkpoints.

use std::sync::Arc;

use chrono::Utc;
use runloop_types::conversation::{ConversationChain, Summary, new_id};
use runloop_types::error::RepositoryError;
use runloop_types::llm::Usage;
use runloop_types::message::{FunctionCallApprovalResponseMessage, Message, Meta};
use runloop_types::run::{RUN_STATE_META_KEY, RunState, RunStateError, Step};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::repository::ConversationPersistence;

use super::summarizer::{BoxSummarizer, ConversationHistory, RunMessages};

/// Errors from run manager operations.
#[derive(Debug, Error)]
pub enum RunManagerError {
    #[error(transparent)]
    Persistence(#[from] RepositoryError),

    #[error("invalid resume input: {0}")]
    InvalidResumeInput(String),

    #[error(transparent)]
    InvalidTransition(#[from] RunStateError),

    #[error("failed to serialize run state: {0}")]
    Serialization(String),
}

/// A compaction not yet stored; its thread is only known after the next save.
struct PendingSummary {
    message: Message,
    last_summarized_message_id: String,
}

pub struct ConversationRunManager<P: ConversationPersistence> {
    persistence: Arc<P>,
    summarizer: Option<BoxSummarizer>,
    namespace: String,
    conversation_id: String,
    /// Thread the run's record lives in. Starts as the loaded chain's thread
    /// and follows every save, which may have forked a new one.
    thread_id: Option<String>,
    run_id: String,
    previous_run_id: Option<String>,
    history: ConversationHistory,
    new_messages: Vec<Message>,
    /// Usage since the last compaction; drives the summarizer.
    usage: Usage,
    run_state: RunState,
    pending_summary: Option<PendingSummary>,
    approval: Option<FunctionCallApprovalResponseMessage>,
    fresh: bool,
}

impl<P: ConversationPersistence> ConversationRunManager<P> {
    /// Load the chain ending at `previous_run_id` and start or resume a run.
    ///
    /// A fresh run starts when the last record carries no run state or a
    /// completed one. Otherwise the last record's run resumes; a run paused
    /// for approval only resumes with an approval response as the first
    /// caller message.
    pub async fn new_run(
        persistence: Arc<P>,
        summarizer: Option<BoxSummarizer>,
        namespace: &str,
        previous_run_id: Option<&str>,
        mut messages: Vec<Message>,
    ) -> Result<Self, RunManagerError> {
        let chain = persistence.load_messages(namespace, previous_run_id).await?;
        let conversation_id = match chain.conversation_id() {
            Some(id) => id.to_string(),
            None => persistence.new_conversation_id().await?,
        };
        let thread_id = chain.last().map(|r| r.thread_id.clone());
        let last_state = chain.last().and_then(|r| r.run_state());
        let (history, last_record) = split_chain(chain);

        let mut approval = None;
        let (run_id, previous, run_state, usage, fresh) = match (last_state, last_record) {
            (Some(state), Some((record_id, record_previous))) if !state.is_complete() => {
                let mut state = state;
                if state.current_step == Step::AwaitApproval {
                    if messages.is_empty() {
                        return Err(RunManagerError::InvalidResumeInput(
                            "a paused run needs an approval response".to_string(),
                        ));
                    }
                    match messages.remove(0) {
                        Message::FunctionCallApprovalResponse(response) => {
                            approval = Some(response);
                        }
                        other => {
                            return Err(RunManagerError::InvalidResumeInput(format!(
                                "expected function_call_approval_response, got {}",
                                other.kind()
                            )));
                        }
                    }
                    state.resume_from_approval()?;
                }
                info!(
                    namespace,
                    run_id = %record_id,
                    step = %state.current_step,
                    loop_iteration = state.loop_iteration,
                    "resuming run"
                );
                (record_id, record_previous, state, Usage::default(), false)
            }
            (state, record) => {
                let carried = state.map(|s| s.usage).unwrap_or_default();
                let previous = record.map(|(id, _)| id);
                let run_id = persistence.new_run_id().await?;
                debug!(namespace, %run_id, previous = ?previous, "starting fresh run");
                (run_id, previous, RunState::new(), carried, true)
            }
        };

        if approval.is_none() {
            if let Some(pos) = messages
                .iter()
                .position(|m| matches!(m, Message::FunctionCallApprovalResponse(_)))
            {
                return Err(RunManagerError::InvalidResumeInput(format!(
                    "approval response at position {pos} without a paused run"
                )));
            }
        }

        Ok(Self {
            persistence,
            summarizer,
            namespace: namespace.to_string(),
            conversation_id,
            thread_id,
            run_id,
            previous_run_id: previous,
            history,
            new_messages: messages,
            usage,
            run_state,
            pending_summary: None,
            approval,
            fresh,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Thread of the last loaded or saved record; `None` before anything exists.
    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn previous_run_id(&self) -> Option<&str> {
        self.previous_run_id.as_deref()
    }

    /// Whether this call started a new run (as opposed to resuming one).
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn run_state(&self) -> &RunState {
        &self.run_state
    }

    pub fn run_state_mut(&mut self) -> &mut RunState {
        &mut self.run_state
    }

    /// The approval verdict supplied on resume, at most once.
    pub fn take_approval_response(&mut self) -> Option<FunctionCallApprovalResponseMessage> {
        self.approval.take()
    }

    /// Messages not yet checkpointed.
    pub fn pending_messages(&self) -> &[Message] {
        &self.new_messages
    }

    /// Full model context: summary, old runs, then new messages.
    ///
    /// Consults the summarizer first. A failed summarization is logged and
    /// the uncompacted history is used.
    pub async fn get_messages(&mut self) -> Vec<Message> {
        if let Some(summarizer) = &self.summarizer {
            match summarizer.summarize(&self.history, &self.usage).await {
                Ok(Some(result)) => {
                    info!(
                        run_id = %self.run_id,
                        last_summarized = %result.last_summarized_message_id,
                        kept_runs = result.kept.len(),
                        "conversation compacted"
                    );
                    self.history.runs = result.kept;
                    if let Some(message) = result.summary_message {
                        self.history.summary = Some(message.clone());
                        self.pending_summary = Some(PendingSummary {
                            message,
                            last_summarized_message_id: result.last_summarized_message_id,
                        });
                    }
                    self.usage = Usage::default();
                }
                Ok(None) => {}
                Err(e) => warn!(run_id = %self.run_id, error = %e, "summarization failed"),
            }
        }

        let mut messages = self.history.flatten();
        messages.extend(self.new_messages.iter().cloned());
        messages
    }

    /// Buffer messages and accumulate usage.
    pub fn add_messages(&mut self, messages: Vec<Message>, usage: Option<Usage>) {
        self.new_messages.extend(messages);
        if let Some(usage) = usage {
            self.run_state.add_usage(&usage);
            self.usage.add(&usage);
        }
    }

    /// Checkpoint: persist buffered messages with `meta` plus the serialized
    /// run state, then any pending summary on the thread the record landed in.
    ///
    /// When the run is complete the next run id is allocated and the
    /// previous-run pointer advances, so a follow-up call continues after it.
    pub async fn save_messages(&mut self, mut meta: Meta) -> Result<(), RunManagerError> {
        let state = serde_json::to_value(&self.run_state)
            .map_err(|e| RunManagerError::Serialization(e.to_string()))?;
        meta.insert(RUN_STATE_META_KEY.to_string(), state);

        let thread_id = self
            .persistence
            .save_messages(
                &self.namespace,
                &self.run_id,
                self.previous_run_id.as_deref(),
                &self.conversation_id,
                &self.new_messages,
                &meta,
            )
            .await?;
        debug!(
            run_id = %self.run_id,
            thread_id = %thread_id,
            saved = self.new_messages.len(),
            step = %self.run_state.current_step,
            "checkpoint saved"
        );

        // A fork already inherited the parent's summary; this one replaces it
        // on the record's own thread only.
        if let Some(pending) = self.pending_summary.take() {
            let summary = Summary {
                id: new_id("sum"),
                thread_id: thread_id.clone(),
                summary_message: pending.message,
                last_summarized_message_id: pending.last_summarized_message_id,
                meta: Meta::new(),
                created_at: Utc::now(),
            };
            self.persistence.save_summary(&self.namespace, &summary).await?;
        }
        self.thread_id = Some(thread_id);

        let saved = std::mem::take(&mut self.new_messages);
        match self.history.runs.last_mut() {
            Some(run) if run.run_id == self.run_id => run.messages.extend(saved),
            _ => self.history.runs.push(RunMessages {
                run_id: self.run_id.clone(),
                messages: saved,
            }),
        }

        if self.run_state.is_complete() {
            let next = self.persistence.new_run_id().await?;
            let finished = std::mem::replace(&mut self.run_id, next);
            self.previous_run_id = Some(finished);
            self.run_state = RunState::new();
        }
        Ok(())
    }
}

/// Split a loaded chain into grouped history and the last record's
/// `(id, previous_id)`.
fn split_chain(chain: ConversationChain) -> (ConversationHistory, Option<(String, Option<String>)>) {
    let last = chain
        .last()
        .map(|r| (r.message_id.clone(), r.previous_message_id.clone()));
    let history = ConversationHistory {
        summary: chain.summary.map(|s| s.summary_message),
        runs: chain
            .records
            .into_iter()
            .map(|r| RunMessages {
                run_id: r.message_id,
                messages: r.messages,
            })
            .collect(),
    };
    (history, last)
}

impl<P: ConversationPersistence> std::fmt::Debug for ConversationRunManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationRunManager")
            .field("namespace", &self.namespace)
            .field("conversation_id", &self.conversation_id)
            .field("run_id", &self.run_id)
            .field("thread_id", &self.thread_id)
            .field("previous_run_id", &self.previous_run_id)
            .field("step", &self.run_state.current_step)
            .field("old_runs", &self.history.runs.len())
            .field("new_messages", &self.new_messages.len())
            .finish()
    }
}
