//! Process-local adapters.

pub mod store;

pub use store::InMemoryConversationStore;
