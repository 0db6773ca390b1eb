//! Observability setup for runloop binaries.

pub mod tracing_setup;
