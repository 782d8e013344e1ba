//! # rtu-sync - Real-Time Update Channel Client
//!
//! Keeps a persistent WebSocket channel to a remote service, routes the
//! messages it pushes to scoped subscribers, and falls back to HTTP whenever
//! the channel is not ready.
//!
//! ## Features
//!
//! - **Connection lifecycle**: automatic restart on transient closure, a
//!   permanent close code, `Pong` heartbeats answered with one `PING`
//! - **Scoped routing**: handlers per service or per service and object,
//!   removable in bulk by identity
//! - **Dual transport**: one send contract, channel when ready, HTTP otherwise
//! - **Reconciliation**: last-write-wins merge of server pushes into local,
//!   persisted collections, with batched flushes of local changes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rtu_sync::{RtuClient, RtuConfig};
//! use rtu_sync::protocol::OutboundRequest;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = RtuClient::new(RtuConfig::new("https://api.example.com/v1")?)?;
//!     client.open().await?;
//!     client.start();
//!
//!     let delivery = client.send(&OutboundRequest::get("Books", "Bookmarks")).await;
//!     println!("{delivery:?}");
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod protocol;
pub mod reconcile;
pub mod server;
pub mod storage;
pub mod sync;

// Re-export main types for library consumers
pub use client::RtuClient;
pub use config::RtuConfig;
pub use error::{categorize_error, ErrorCategory, ReconnectPolicy};
pub use protocol::{MessageEnvelope, OutboundRequest};
pub use reconcile::{Bookmark, ReconciliationEngine};
pub use sync::{ConnectionManager, ConnectionState, Delivery, EventBus, MessageRouter, OutboundBroker};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
