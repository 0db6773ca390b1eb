//! Conversation timeline management: the per-run manager and compaction.

pub mod run_manager;
pub mod summarizer;

pub use run_manager::{ConversationRunManager, RunManagerError};
pub use summarizer::{
    BoxSummarizer, ConversationHistory, LlmSummarizer, RunMessages, SlidingWindowSummarizer,
    SummarizationPolicy, Summarizer, SummarizerError, SummaryResult,
};
