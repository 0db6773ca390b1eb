//! Conversation compaction.
//!
//! History is grouped by run. When accumulated usage crosses a token
//! threshold and there are more runs than the policy keeps verbatim, the
//! older runs are replaced: by an LLM-written summary (`LlmSummarizer`) or
//! simply dropped (`SlidingWindowSummarizer`). Summaries are derived data,
//! so recomputing one after a crash is harmless.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use runloop_types::config::SummarizerSection;
use runloop_types::llm::{LlmError, LlmRequest, Usage};
use runloop_types::message::Message;
use thiserror::Error;
use tracing::{Instrument, debug, info_span};

use crate::llm::LlmProvider;
use crate::stream::read_stream;

/// System prompt for the summarization LLM call.
const SUMMARY_SYSTEM_PROMPT: &str = r#"Summarize the following conversation segment concisely. Preserve:
1. Key decisions and conclusions
2. Important facts mentioned, including tool results
3. The user's current goals and context
4. Any unresolved questions

If a previous summary is provided, fold it into the new one.
Keep the summary under 500 words. Write in third person (e.g., "The user asked about..." "The assistant recommended...")."#;

/// Prefix of the message that stands in for summarized history.
pub const SUMMARY_PREFIX: &str = "Summary of the earlier conversation:";

/// Errors from summarization.
#[derive(Debug, Error)]
pub enum SummarizerError {
    #[error("summarization llm call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("summarization failed: {0}")]
    Failed(String),
}

/// The messages of one persisted run record.
#[derive(Debug, Clone, PartialEq)]
pub struct RunMessages {
    pub run_id: String,
    pub messages: Vec<Message>,
}

/// Loaded history, grouped by run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationHistory {
    /// Stand-in for runs summarized earlier.
    pub summary: Option<Message>,
    pub runs: Vec<RunMessages>,
}

impl ConversationHistory {
    /// Summary first, then every run's messages in order.
    pub fn flatten(&self) -> Vec<Message> {
        self.summary
            .iter()
            .cloned()
            .chain(self.runs.iter().flat_map(|r| r.messages.iter().cloned()))
            .collect()
    }
}

/// Replacement for the head of a history.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryResult {
    /// New stand-in message; `None` means the old runs are simply dropped.
    pub summary_message: Option<Message>,
    /// Runs kept verbatim after the summary.
    pub kept: Vec<RunMessages>,
    /// The last run folded into the summary.
    pub last_summarized_message_id: String,
}

/// When and how much to compact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummarizationPolicy {
    pub token_threshold: u64,
    pub keep_recent_runs: usize,
}

impl Default for SummarizationPolicy {
    fn default() -> Self {
        Self {
            token_threshold: 100_000,
            keep_recent_runs: 4,
        }
    }
}

impl From<&SummarizerSection> for SummarizationPolicy {
    fn from(section: &SummarizerSection) -> Self {
        Self {
            token_threshold: section.token_threshold,
            keep_recent_runs: section.keep_recent_runs,
        }
    }
}

impl SummarizationPolicy {
    pub fn should_summarize(&self, history: &ConversationHistory, usage: &Usage) -> bool {
        usage.total_tokens > self.token_threshold && history.runs.len() > self.keep_recent_runs
    }

    /// Split runs into `(to_summarize, to_keep)`; `to_keep` holds the most
    /// recent `keep_recent_runs`.
    pub fn split<'a>(&self, runs: &'a [RunMessages]) -> (&'a [RunMessages], &'a [RunMessages]) {
        if runs.len() <= self.keep_recent_runs {
            (&[], runs)
        } else {
            runs.split_at(runs.len() - self.keep_recent_runs)
        }
    }
}

/// Compacts conversation history.
///
/// Returns `Ok(None)` when nothing should change.
pub trait Summarizer: Send + Sync {
    fn summarize(
        &self,
        history: &ConversationHistory,
        usage: &Usage,
    ) -> impl Future<Output = Result<Option<SummaryResult>, SummarizerError>> + Send;
}

/// Object-safe version of [`Summarizer`] with boxed futures.
pub trait SummarizerDyn: Send + Sync {
    fn summarize_boxed<'a>(
        &'a self,
        history: &'a ConversationHistory,
        usage: &'a Usage,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SummaryResult>, SummarizerError>> + Send + 'a>>;
}

impl<T: Summarizer> SummarizerDyn for T {
    fn summarize_boxed<'a>(
        &'a self,
        history: &'a ConversationHistory,
        usage: &'a Usage,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SummaryResult>, SummarizerError>> + Send + 'a>>
    {
        Box::pin(self.summarize(history, usage))
    }
}

/// Type-erased, cheaply cloneable summarizer.
#[derive(Clone)]
pub struct BoxSummarizer {
    inner: Arc<dyn SummarizerDyn>,
}

impl BoxSummarizer {
    pub fn new<T: Summarizer + 'static>(summarizer: T) -> Self {
        Self {
            inner: Arc::new(summarizer),
        }
    }

    pub async fn summarize(
        &self,
        history: &ConversationHistory,
        usage: &Usage,
    ) -> Result<Option<SummaryResult>, SummarizerError> {
        self.inner.summarize_boxed(history, usage).await
    }
}

impl std::fmt::Debug for BoxSummarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxSummarizer")
    }
}

/// Drops old runs without writing a summary.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindowSummarizer {
    pub policy: SummarizationPolicy,
}

impl SlidingWindowSummarizer {
    pub fn new(policy: SummarizationPolicy) -> Self {
        Self { policy }
    }
}

impl Summarizer for SlidingWindowSummarizer {
    async fn summarize(
        &self,
        history: &ConversationHistory,
        usage: &Usage,
    ) -> Result<Option<SummaryResult>, SummarizerError> {
        if !self.policy.should_summarize(history, usage) {
            return Ok(None);
        }
        let (dropped, kept) = self.policy.split(&history.runs);
        let Some(last) = dropped.last() else {
            return Ok(None);
        };
        debug!(dropped = dropped.len(), kept = kept.len(), "sliding window applied");
        Ok(Some(SummaryResult {
            summary_message: None,
            kept: kept.to_vec(),
            last_summarized_message_id: last.run_id.clone(),
        }))
    }
}

/// Writes the summary with a model call through an [`LlmProvider`].
pub struct LlmSummarizer {
    provider: Arc<dyn LlmProvider>,
    model: String,
    policy: SummarizationPolicy,
}

impl LlmSummarizer {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        model: impl Into<String>,
        policy: SummarizationPolicy,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            policy,
        }
    }

    fn build_request(&self, previous: Option<&Message>, runs: &[RunMessages]) -> LlmRequest {
        let mut sections = Vec::new();
        if let Some(previous) = previous {
            sections.push(format!(
                "<previous_summary>\n{}\n</previous_summary>",
                previous.to_text()
            ));
        }
        let conversation_text = runs
            .iter()
            .flat_map(|r| r.messages.iter())
            .map(Message::to_text)
            .collect::<Vec<_>>()
            .join("\n\n");
        sections.push(format!(
            "<conversation>\n{conversation_text}\n</conversation>"
        ));

        LlmRequest {
            model: self.model.clone(),
            instructions: Some(SUMMARY_SYSTEM_PROMPT.to_string()),
            input: vec![Message::user(format!(
                "Please summarize this conversation:\n\n{}",
                sections.join("\n\n")
            ))],
            tools: Vec::new(),
            temperature: Some(0.0),
            max_output_tokens: Some(1024),
        }
    }
}

impl Summarizer for LlmSummarizer {
    async fn summarize(
        &self,
        history: &ConversationHistory,
        usage: &Usage,
    ) -> Result<Option<SummaryResult>, SummarizerError> {
        if !self.policy.should_summarize(history, usage) {
            return Ok(None);
        }
        let (to_summarize, kept) = self.policy.split(&history.runs);
        let Some(last) = to_summarize.last() else {
            return Ok(None);
        };

        let request = self.build_request(history.summary.as_ref(), to_summarize);
        let span = info_span!(
            "gen_ai.summarize",
            gen_ai.system = self.provider.name(),
            gen_ai.request.model = %self.model,
            runs = to_summarize.len(),
        );
        let result = read_stream(self.provider.stream(request), None)
            .instrument(span)
            .await?;

        let text = result
            .output
            .iter()
            .filter_map(|m| match m {
                Message::Output(out) => Some(out.content.trim()),
                _ => None,
            })
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if text.is_empty() {
            return Err(SummarizerError::Failed(
                "model returned an empty summary".to_string(),
            ));
        }

        Ok(Some(SummaryResult {
            summary_message: Some(Message::system(format!("{SUMMARY_PREFIX}\n{text}"))),
            kept: kept.to_vec(),
            last_summarized_message_id: last.run_id.clone(),
        }))
    }
}
