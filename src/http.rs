//! HTTP transport used by the outbound broker when the channel is down.
//!
//! The broker only sees the [`HttpTransport`] trait; [`ReqwestTransport`] is
//! the production implementation.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use reqwest::{header, Client, Method};
use serde_json::Value;
use url::Url;

/// One fallback call, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpCall {
    pub verb: String,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Performs an [`HttpCall`] and decodes the response body.
pub trait HttpTransport: Send + Sync {
    fn execute(&self, call: HttpCall) -> BoxFuture<'_, Result<Value>>;
}

/// reqwest-backed transport
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;

        Ok(Self { client })
    }

    async fn perform(&self, call: HttpCall) -> Result<Value> {
        let method = Method::from_bytes(call.verb.to_uppercase().as_bytes())
            .with_context(|| format!("invalid http verb {}", call.verb))?;

        let mut request = self.client.request(method, call.url.clone());
        for (name, value) in &call.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = call.body {
            request = request
                .header(header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("http fallback {} {} failed", call.verb, call.url.path()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("http fallback {} returned {} - {}", call.url.path(), status, body);
        }

        let text = response.text().await.context("failed to read http response")?;
        Ok(decode_body(&text))
    }
}

impl HttpTransport for ReqwestTransport {
    fn execute(&self, call: HttpCall) -> BoxFuture<'_, Result<Value>> {
        Box::pin(self.perform(call))
    }
}

/// Empty bodies decode to `null`, non-JSON bodies to a string.
pub fn decode_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
