//! NATS JetStream integration
//!
//! Publishes dispatches to NATS streams.

mod publisher;
mod sink;

pub use publisher::{ensure_streams, subject_for, NatsPublisher, PublishStats};
pub use sink::NatsSink;
