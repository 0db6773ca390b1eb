//! Shared domain types for runloop.
//!
//! This crate contains the data types used across the runloop workspace:
//! messages, streaming chunks, run state, persisted conversation records,
//! runtime configuration, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod agent;
pub mod chunk;
pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod message;
pub mod run;
