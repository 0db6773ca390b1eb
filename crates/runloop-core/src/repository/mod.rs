//! Persistence port traits.
//!
//! Implementations live in runloop-infra (in-memory and SQLite stores).

pub mod conversation;

pub use conversation::ConversationPersistence;
