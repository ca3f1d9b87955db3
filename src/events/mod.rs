//! Event handling module
//!
//! The dispatch sink seam and envelope serialization for the message broker.

pub mod serialize;
mod sink;

pub use serialize::{serialize_dispatch, GatewayEvent};
pub use sink::{EventSink, LogSink};
