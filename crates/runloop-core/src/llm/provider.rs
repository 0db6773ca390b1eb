//! LlmProvider trait definition.
//!
//! Providers translate an [`LlmRequest`] into their own wire format and yield
//! the response as an ordered stream of [`Chunk`]s. Concrete HTTP clients
//! live outside this workspace; the engine only sees this trait.
//!
//! The trait is object-safe (the stream is boxed, `name` is sync), so agents
//! hold providers as `Arc<dyn LlmProvider>` without a separate wrapper type.

use std::pin::Pin;

use futures_util::Stream;

use runloop_types::chunk::Chunk;
use runloop_types::llm::{LlmError, LlmRequest};

/// Boxed, ordered stream of provider chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk, LlmError>> + Send + 'static>>;

/// Trait for streaming LLM backends.
pub trait LlmProvider: Send + Sync {
    /// Human-readable provider name (e.g., "openai", "anthropic").
    fn name(&self) -> &str;

    /// Send a streaming request. Returns the response chunks in order.
    fn stream(&self, request: LlmRequest) -> ChunkStream;
}
