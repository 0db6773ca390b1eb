//! Conversation persistence trait definition.

use runloop_types::conversation::{ConversationChain, Summary};
use runloop_types::error::RepositoryError;
use runloop_types::message::{Message, Meta};

/// Repository trait for conversation records and thread summaries.
///
/// Stores must be safe for concurrent use by distinct runs. Threads branch
/// copy-on-write: saving a new record after a non-tip record forks a new
/// thread whose prefix is copied from the original through that record.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ConversationPersistence: Send + Sync {
    /// Allocate a new conversation id.
    fn new_conversation_id(
        &self,
    ) -> impl std::future::Future<Output = Result<String, RepositoryError>> + Send;

    /// Allocate a new run (message record) id.
    fn new_run_id(&self) -> impl std::future::Future<Output = Result<String, RepositoryError>> + Send;

    /// Load the chain ending at `previous_message_id`.
    ///
    /// Returns an empty chain when `previous_message_id` is `None` or unknown.
    /// When the thread has a summary whose boundary lies inside the chain, the
    /// summarized prefix is omitted and the summary is returned alongside.
    fn load_messages(
        &self,
        namespace: &str,
        previous_message_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<ConversationChain, RepositoryError>> + Send;

    /// Append `messages` to the record `message_id`, creating it (and possibly
    /// a new thread) when it does not exist yet. `meta` replaces the record's
    /// metadata. Returns the id of the thread the record lives in.
    ///
    /// Saving the same messages and meta to the same record twice is a no-op.
    #[allow(clippy::too_many_arguments)]
    fn save_messages(
        &self,
        namespace: &str,
        message_id: &str,
        previous_message_id: Option<&str>,
        conversation_id: &str,
        messages: &[Message],
        meta: &Meta,
    ) -> impl std::future::Future<Output = Result<String, RepositoryError>> + Send;

    /// Store the summary for `summary.thread_id`, replacing any previous one.
    fn save_summary(
        &self,
        namespace: &str,
        summary: &Summary,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
