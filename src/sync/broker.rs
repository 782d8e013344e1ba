//! One send contract over two transports.
//!
//! When the channel is open a request is written to it and forgotten; a
//! reply, if any, comes back as a regular inbound frame. Otherwise the same
//! request becomes an HTTP call and its decoded body is handed back.

use std::sync::Arc;

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::Value;
use url::Url;

use super::connection::ConnectionManager;
use crate::config::RtuConfig;
use crate::error::categorize_error;
use crate::http::{HttpCall, HttpTransport};
use crate::protocol::OutboundRequest;

/// Header carrying the authentication token on fallback calls.
pub const TOKEN_HEADER: &str = "X-Rtu-Token";
/// Header carrying the device identifier on fallback calls.
pub const DEVICE_HEADER: &str = "X-Device-Id";
/// Query parameter carrying the encoded `extra` payload.
pub const EXTRAS_PARAM: &str = "extras";

/// How a request left the process.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Written to the channel; no response is awaited
    Channel,
    /// Sent over HTTP; carries the decoded response body
    Fallback(Value),
    /// Could not be sent; already logged
    Failed,
}

impl Delivery {
    /// Response body of a fallback call.
    pub fn into_body(self) -> Option<Value> {
        match self {
            Delivery::Fallback(body) => Some(body),
            _ => None,
        }
    }
}

pub struct OutboundBroker {
    connection: ConnectionManager,
    http: Arc<dyn HttpTransport>,
    base_url: Url,
    token: Option<String>,
    device_id: String,
}

impl OutboundBroker {
    pub fn new(config: &RtuConfig, connection: ConnectionManager, http: Arc<dyn HttpTransport>) -> Self {
        Self {
            connection,
            http,
            base_url: config.base_url.clone(),
            token: config.token.clone(),
            device_id: config.device_id.clone(),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Send over the channel if it is ready, else over HTTP. Never fails:
    /// errors are logged and reported as [`Delivery::Failed`].
    pub async fn send(&self, request: &OutboundRequest) -> Delivery {
        if self.connection.is_ready() {
            match request.to_frame() {
                Ok(frame) => {
                    if self.connection.send_text(frame) {
                        return Delivery::Channel;
                    }
                    tracing::debug!(
                        service = %request.service_name,
                        "channel went away before write, using http"
                    );
                }
                Err(err) => {
                    tracing::warn!(service = %request.service_name, error = %err, "dropping request");
                    return Delivery::Failed;
                }
            }
        }

        match self.fallback(request).await {
            Ok(body) => Delivery::Fallback(body),
            Err(err) => {
                tracing::warn!(
                    service = %request.service_name,
                    object = %request.object_name,
                    verb = %request.verb,
                    category = ?categorize_error(&err),
                    error = %format!("{err:#}"),
                    "http fallback failed"
                );
                Delivery::Failed
            }
        }
    }

    /// Perform `request` over HTTP regardless of the channel state.
    pub async fn fallback(&self, request: &OutboundRequest) -> Result<Value> {
        let call = self.http_call(request)?;
        tracing::debug!(verb = %call.verb, path = call.url.path(), "http fallback");
        self.http.execute(call).await
    }

    /// `VERB {base}/{service}/{object}[/{identity}]?{query}&extras={token}`
    pub fn http_call(&self, request: &OutboundRequest) -> Result<HttpCall> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("config: base url cannot carry a path"))?;
            segments
                .pop_if_empty()
                .push(&request.service_name)
                .push(&request.object_name);
            if let Some(identity) = &request.identity {
                segments.push(identity);
            }
        }

        let mut pairs = request.query_pairs();
        if let Some(extra) = &request.extra {
            let json = serde_json::to_vec(extra).context("failed to encode request extras")?;
            pairs.push((EXTRAS_PARAM.to_string(), URL_SAFE_NO_PAD.encode(json)));
        }
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }

        let mut headers = Vec::with_capacity(request.header.len() + 2);
        if let Some(token) = &self.token {
            headers.push((TOKEN_HEADER.to_string(), token.clone()));
        }
        headers.push((DEVICE_HEADER.to_string(), self.device_id.clone()));
        headers.extend(request.header.iter().map(|(k, v)| (k.clone(), v.clone())));

        Ok(HttpCall {
            verb: request.verb.to_uppercase(),
            url,
            headers,
            body: request.body_text()?,
        })
    }
}

/// Decode an `extras` query token back into its JSON value.
pub fn decode_extras(token: &str) -> Result<Value> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .context("extras token is not base64")?;
    serde_json::from_slice(&bytes).context("extras token is not json")
}
