//! NATS adapters.

pub mod broker;

pub use broker::NatsStreamBroker;
