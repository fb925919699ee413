//! Fleet Protocol Definitions
//!
//! This crate defines the JSON wire envelope exchanged between the control plane
//! and its agents/nodes, the typed payloads carried in the envelope `data` field,
//! and the messages relayed between control-plane instances over the event bus.

pub mod bus;
pub mod envelope;
pub mod messages;
pub mod sync;

pub use bus::{topics, BusCommand, BusProbeResult, ResourceKind, StatusEvent};
pub use envelope::{message_type, Envelope, ProtoError};
pub use messages::*;
pub use sync::*;
