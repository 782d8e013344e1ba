//! Real-time update channel: connection lifecycle, routing, outbound sends
//! and the in-process event bus.

pub mod broker;
pub mod connection;
pub mod events;
pub mod router;

pub use broker::{Delivery, OutboundBroker};
pub use connection::{ConnectionHooks, ConnectionManager, ConnectionState, FrameOutcome, StartOutcome};
pub use events::{BusEvent, EventBus};
pub use router::{EnvelopeHandler, MessageRouter};
