//! Agent execution engine and port traits for runloop.
//!
//! This crate defines the "ports" (persistence, LLM provider, tool, stream
//! broker) that the infrastructure layer implements, plus the run loop that
//! drives them. It depends only on `runloop-types`, never on
//! `runloop-infra` or any database/IO crate.

pub mod agent;
pub mod conversation;
pub mod durable;
pub mod llm;
pub mod repository;
pub mod stream;
pub mod tool;

#[cfg(test)]
pub(crate) mod testing;
