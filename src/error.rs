//! Error taxonomy and reconnect policy
//!
//! Classifies failures into the categories the client reacts to differently
//! and decides how long to wait before a channel reconnect.

use std::time::Duration;

use crate::protocol::{ProtocolError, ProtocolErrorKind};

/// Reconnect delay configuration
///
/// The default is a fixed short delay with no growth and no attempt ceiling.
/// A multiplier above `1.0` turns it into exponential backoff capped at
/// `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt
    pub initial_delay: Duration,

    /// Growth factor applied per consecutive failure
    pub backoff_multiplier: f64,

    /// Upper bound for the delay
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(123),
            backoff_multiplier: 1.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Fixed delay, never grows
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            backoff_multiplier: 1.0,
            max_delay: delay,
        }
    }

    /// Exponential backoff between `initial_delay` and `max_delay`
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            backoff_multiplier: 2.0,
            max_delay,
        }
    }

    /// Delay before reconnect number `attempt` (1-based, consecutive failures)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.backoff_multiplier <= 1.0 {
            return self.initial_delay;
        }
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Categorized error types for better handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Channel closed or unreachable (retryable)
    Transport,

    /// Decoded `Error` frame from the server
    Protocol(ProtocolErrorKind),

    /// A registered handler failed
    Consumer,

    /// HTTP fallback call failed
    Fallback,

    /// Durable storage failed
    Storage,

    /// Invalid configuration (not retryable)
    Configuration,

    /// Unknown errors
    Unknown,
}

impl ErrorCategory {
    /// Only transport errors trigger an automatic retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transport)
    }
}

/// Categorize an error
pub fn categorize_error(error: &anyhow::Error) -> ErrorCategory {
    if let Some(protocol) = error.downcast_ref::<ProtocolError>() {
        return ErrorCategory::Protocol(protocol.kind);
    }
    if error.downcast_ref::<tokio_tungstenite::tungstenite::Error>().is_some() {
        return ErrorCategory::Transport;
    }
    if error.downcast_ref::<reqwest::Error>().is_some() {
        return ErrorCategory::Fallback;
    }
    if error.downcast_ref::<rusqlite::Error>().is_some() {
        return ErrorCategory::Storage;
    }

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection")
        || error_str.contains("websocket")
        || error_str.contains("channel closed")
    {
        ErrorCategory::Transport
    } else if error_str.contains("http") || error_str.contains("fallback") {
        ErrorCategory::Fallback
    } else if error_str.contains("storage") || error_str.contains("database") {
        ErrorCategory::Storage
    } else if error_str.contains("config") || error_str.contains("invalid url") {
        ErrorCategory::Configuration
    } else if error_str.contains("handler") {
        ErrorCategory::Consumer
    } else {
        ErrorCategory::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        let net_err = anyhow::anyhow!("WebSocket connection refused");
        assert_eq!(categorize_error(&net_err), ErrorCategory::Transport);

        let cfg_err = anyhow::anyhow!("config: RTU_BASE_URL missing");
        assert_eq!(categorize_error(&cfg_err), ErrorCategory::Configuration);

        let protocol = anyhow::Error::new(ProtocolError {
            code: Some(401),
            message: "token expired".into(),
            kind: ProtocolErrorKind::Authorization,
        });
        assert_eq!(
            categorize_error(&protocol),
            ErrorCategory::Protocol(ProtocolErrorKind::Authorization)
        );
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorCategory::Transport.is_retryable());
        assert!(!ErrorCategory::Protocol(ProtocolErrorKind::Generic).is_retryable());
        assert!(!ErrorCategory::Fallback.is_retryable());
    }

    #[test]
    fn test_default_policy_is_fixed() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(123));
        assert_eq!(policy.delay_for(50), Duration::from_millis(123));
    }

    #[test]
    fn test_exponential_policy_is_capped() {
        let policy =
            ReconnectPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(10), Duration::from_secs(1));
    }
}
