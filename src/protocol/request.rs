use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A request handed to the outbound broker.
///
/// The same value is written to the channel when it is ready and translated
/// into an HTTP call otherwise.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundRequest {
    pub service_name: String,
    pub object_name: String,
    pub verb: String,
    /// Trailing path segment on the HTTP path, e.g. a record id.
    pub identity: Option<String>,
    pub query: Map<String, Value>,
    pub header: BTreeMap<String, String>,
    pub body: Option<Value>,
    /// Opaque payload; sent as the `extras` token on the HTTP path.
    pub extra: Option<Value>,
}

impl OutboundRequest {
    pub fn new(
        service_name: impl Into<String>,
        object_name: impl Into<String>,
        verb: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            object_name: object_name.into(),
            verb: verb.into(),
            ..Default::default()
        }
    }

    pub fn get(service_name: impl Into<String>, object_name: impl Into<String>) -> Self {
        Self::new(service_name, object_name, "GET")
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_extra(mut self, extra: impl Into<Value>) -> Self {
        self.extra = Some(extra.into());
        self
    }

    /// Body as transmitted: strings go out verbatim, structured values are
    /// serialized to JSON text.
    pub fn body_text(&self) -> Result<Option<String>> {
        match &self.body {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.clone())),
            Some(value) => serde_json::to_string(value)
                .map(Some)
                .context("failed to serialize request body"),
        }
    }

    /// Query parameters flattened to strings, in key order.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.query
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect()
    }

    pub fn to_wire(&self) -> Result<WireRequest> {
        Ok(WireRequest {
            service_name: self.service_name.clone(),
            object_name: self.object_name.clone(),
            verb: self.verb.clone(),
            identity: self.identity.clone(),
            query: self.query.clone(),
            header: self.header.clone(),
            body: self.body_text()?,
            extra: self.extra.clone(),
        })
    }

    /// The channel frame for this request.
    pub fn to_frame(&self) -> Result<String> {
        serde_json::to_string(&self.to_wire()?).context("failed to serialize outbound frame")
    }
}

/// Channel representation of an [`OutboundRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WireRequest {
    pub service_name: String,
    pub object_name: String,
    pub verb: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default)]
    pub query: Map<String, Value>,
    #[serde(default)]
    pub header: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub extra: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structured_body_is_pre_serialized() {
        let request = OutboundRequest::new("Books", "Bookmarks", "PUT")
            .with_body(json!([{ "Id": "b1" }]));
        let frame: Value = serde_json::from_str(&request.to_frame().unwrap()).unwrap();

        assert_eq!(frame["ServiceName"], "Books");
        assert_eq!(frame["ObjectName"], "Bookmarks");
        assert_eq!(frame["Verb"], "PUT");
        assert_eq!(frame["Body"], json!(r#"[{"Id":"b1"}]"#));
        assert!(frame.get("Identity").is_none());
    }

    #[test]
    fn test_string_body_is_untouched() {
        let request = OutboundRequest::get("Books", "Items").with_body("raw text");
        assert_eq!(request.body_text().unwrap().as_deref(), Some("raw text"));
    }

    #[test]
    fn test_query_pairs_flatten_values() {
        let request = OutboundRequest::get("Books", "Items")
            .with_query("limit", 10)
            .with_query("lang", "en")
            .with_query("skip", Value::Null);
        assert_eq!(
            request.query_pairs(),
            vec![
                ("lang".to_string(), "en".to_string()),
                ("limit".to_string(), "10".to_string())
            ]
        );
    }
}
