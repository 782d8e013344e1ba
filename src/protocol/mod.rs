//! Wire protocol for the real-time update channel.
//!
//! Inbound frames are JSON objects tagged with a `Type` of the shape
//! `Service[#Object[#Event]]` and carrying a `Data` payload. Outbound frames
//! are [`OutboundRequest`]s serialized with PascalCase field names.

pub mod envelope;
pub mod request;

pub use envelope::{
    InboundFrame, MessageEnvelope, ProtocolError, ProtocolErrorKind, TypeTag, TypeTagCache,
    ERROR_TYPE,
};
pub use request::{OutboundRequest, WireRequest};

/// Separator between the service, object and event parts of a type tag.
pub const TYPE_DELIMITER: char = '#';

/// Heartbeat frame sent by the client.
pub const PING_FRAME: &str = "PING";

/// Heartbeat frame sent in answer to a server `Ping`.
pub const PONG_FRAME: &str = "PONG";

/// Built-in service names intercepted before generic dispatch.
pub mod builtin {
    /// Server heartbeat request; answered with `PONG`.
    pub const PING: &str = "Ping";
    /// Server heartbeat response; answered with the next `PING`.
    pub const PONG: &str = "Pong";
    /// Liveness probe, logged only.
    pub const ALIVE: &str = "Alive";
    /// The user's online status changed on the server.
    pub const ONLINE_STATUS: &str = "OnlineStatus";
    /// Reserved service-scope name used to trigger background sync.
    pub const SCHEDULER: &str = "Scheduler";
}

/// Key of an object-scope registration.
pub fn object_scope_key(service_name: &str, object_name: &str) -> String {
    format!("{service_name}{TYPE_DELIMITER}{object_name}")
}
