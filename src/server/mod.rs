//! Mock RTU server for local development and end-to-end tests.
//!
//! Serves the channel at `/rtu`, the HTTP fallback surface at
//! `/{service}/{object}[/{id}]`, and an `/admin` API to push frames, close
//! channels with a chosen code and inspect what clients sent.

pub mod api;

use anyhow::Result;

pub use api::{router, ServerOptions, ServerState};

pub async fn start(port: u16, options: ServerOptions) -> Result<()> {
    api::serve(port, options).await
}
