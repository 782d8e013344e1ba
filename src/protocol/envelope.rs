use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TYPE_DELIMITER;

/// Reserved `Type` of error frames.
pub const ERROR_TYPE: &str = "Error";

const SECURITY_EXCEPTION: &str = "SecurityException";
const INVALID_REQUEST_EXCEPTION: &str = "InvalidRequestException";

/// A raw inbound frame before its type tag is resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Data", default)]
    pub data: Value,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("inbound frame is not a typed JSON envelope")
    }

    pub fn is_error(&self) -> bool {
        self.kind == ERROR_TYPE
    }
}

/// The service/object/event parts of a wire type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeTag {
    pub service_name: String,
    pub object_name: String,
    pub event_name: String,
}

impl TypeTag {
    /// Split `Service[#Object[#Event]]`. Missing parts are empty; anything
    /// after the third delimiter stays part of the event name.
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.splitn(3, TYPE_DELIMITER);
        let mut next = || parts.next().unwrap_or_default().to_string();
        Self {
            service_name: next(),
            object_name: next(),
            event_name: next(),
        }
    }
}

/// Lookup table of already-parsed type tags keyed by the raw type string.
#[derive(Debug, Default)]
pub struct TypeTagCache {
    tags: DashMap<String, Arc<TypeTag>>,
}

impl TypeTagCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, raw: &str) -> Arc<TypeTag> {
        if let Some(tag) = self.tags.get(raw) {
            return tag.clone();
        }
        self.tags
            .entry(raw.to_string())
            .or_insert_with(|| Arc::new(TypeTag::parse(raw)))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// One decoded inbound message.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    tag: Arc<TypeTag>,
    pub payload: Value,
}

impl MessageEnvelope {
    pub fn new(
        service_name: impl Into<String>,
        object_name: impl Into<String>,
        event_name: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            tag: Arc::new(TypeTag {
                service_name: service_name.into(),
                object_name: object_name.into(),
                event_name: event_name.into(),
            }),
            payload,
        }
    }

    pub fn from_tag(tag: Arc<TypeTag>, payload: Value) -> Self {
        Self { tag, payload }
    }

    pub fn service_name(&self) -> &str {
        &self.tag.service_name
    }

    pub fn object_name(&self) -> &str {
        &self.tag.object_name
    }

    pub fn event_name(&self) -> &str {
        &self.tag.event_name
    }

    pub fn tag(&self) -> &Arc<TypeTag> {
        &self.tag
    }
}

/// How an `Error` frame affects the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// The token was rejected; the channel stops for good.
    Authorization,
    /// The server could not understand a request; the channel stops.
    InvalidRequest,
    /// Anything else; logged and the channel stays open.
    Generic,
}

/// A decoded `Error` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: Option<i64>,
    pub message: String,
    pub kind: ProtocolErrorKind,
}

impl ProtocolError {
    pub fn from_payload(data: &Value) -> Self {
        let code = data.get("Code").and_then(|c| {
            c.as_i64()
                .or_else(|| c.as_str().and_then(|s| s.parse().ok()))
        });
        let message = data
            .get("Message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let marker = data.get("Type").and_then(Value::as_str).unwrap_or_default();

        let kind = if marker.contains(SECURITY_EXCEPTION) || matches!(code, Some(401 | 403)) {
            ProtocolErrorKind::Authorization
        } else if marker == INVALID_REQUEST_EXCEPTION {
            ProtocolErrorKind::InvalidRequest
        } else {
            ProtocolErrorKind::Generic
        };

        Self {
            code,
            message,
            kind,
        }
    }

    /// Whether the channel must be shut down after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.kind, ProtocolErrorKind::Generic)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{:?} error {}: {}", self.kind, code, self.message),
            None => write!(f, "{:?} error: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_tag_parts() {
        let tag = TypeTag::parse("Books#Bookmarks#Sync");
        assert_eq!(tag.service_name, "Books");
        assert_eq!(tag.object_name, "Bookmarks");
        assert_eq!(tag.event_name, "Sync");

        let tag = TypeTag::parse("Pong");
        assert_eq!(tag.service_name, "Pong");
        assert!(tag.object_name.is_empty());
        assert!(tag.event_name.is_empty());

        let tag = TypeTag::parse("A#B#C#D");
        assert_eq!(tag.event_name, "C#D");
    }

    #[test]
    fn test_cache_parses_once() {
        let cache = TypeTagCache::new();
        let first = cache.resolve("Books#Bookmarks");
        let second = cache.resolve("Books#Bookmarks");
        assert!(Arc::ptr_eq(&first, &second));
        cache.resolve("Books#Items");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_frame_without_data() {
        let frame = InboundFrame::parse(r#"{"Type":"Alive"}"#).unwrap();
        assert_eq!(frame.kind, "Alive");
        assert!(frame.data.is_null());
        assert!(InboundFrame::parse("not json").is_err());
    }

    #[test]
    fn test_error_classification() {
        let auth = ProtocolError::from_payload(&json!({
            "Code": 401, "Message": "expired", "Type": "Acme.SecurityException"
        }));
        assert_eq!(auth.kind, ProtocolErrorKind::Authorization);
        assert!(auth.is_fatal());

        let invalid = ProtocolError::from_payload(&json!({
            "Code": "400", "Message": "bad verb", "Type": "InvalidRequestException"
        }));
        assert_eq!(invalid.kind, ProtocolErrorKind::InvalidRequest);
        assert_eq!(invalid.code, Some(400));

        let generic = ProtocolError::from_payload(&json!({ "Code": 500, "Message": "oops" }));
        assert_eq!(generic.kind, ProtocolErrorKind::Generic);
        assert!(!generic.is_fatal());
    }
}
