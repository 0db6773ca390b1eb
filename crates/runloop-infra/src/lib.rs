//! Infrastructure layer for runloop.
//!
//! Contains implementations of the ports defined in `runloop-core`: the
//! in-memory and SQLite conversation stores, the NATS stream broker, and the
//! configuration loader.

pub mod config;
pub mod memory;
pub mod nats;
pub mod sqlite;
