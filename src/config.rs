//! Client configuration
//!
//! Loaded from `RTU_*` environment variables (a `.env` file is honored) or
//! from a TOML file. Durations are given in milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ReconnectPolicy;

/// Closure code the server uses for an intentional, permanent shutdown.
pub const PERMANENT_CLOSE_CODE: u16 = 4000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtuConfig {
    /// HTTP base of the remote service, e.g. `https://api.example.com/v1`
    pub base_url: Url,

    /// Authentication token; sent as the `token` query parameter on the
    /// channel and as a header on the HTTP fallback
    pub token: Option<String>,

    /// Device identifier sent with every HTTP fallback call
    pub device_id: String,

    /// Path of the channel endpoint below `base_url`
    pub channel_path: String,

    /// Delay before the first reconnect attempt
    pub reconnect_delay_ms: u64,

    /// Backoff growth factor; `1.0` keeps the delay fixed
    pub reconnect_multiplier: f64,

    /// Upper bound for the reconnect delay
    pub reconnect_max_delay_ms: u64,

    /// Closure code that suppresses the automatic reconnect
    pub permanent_close_code: u16,

    /// Timeout of HTTP fallback calls
    pub request_timeout_ms: u64,

    /// Per-item delay between lazy entity fetches
    pub fetch_stagger_ms: u64,

    /// Log envelopes that no subscriber is registered for
    pub verbose: bool,

    /// SQLite file for durable storage; in-memory storage when unset
    pub storage_path: Option<PathBuf>,
}

impl Default for RtuConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("http://127.0.0.1:3000").expect("static url"),
            token: None,
            device_id: uuid::Uuid::new_v4().to_string(),
            channel_path: "rtu".to_string(),
            reconnect_delay_ms: 123,
            reconnect_multiplier: 1.0,
            reconnect_max_delay_ms: 30_000,
            permanent_close_code: PERMANENT_CLOSE_CODE,
            request_timeout_ms: 30_000,
            fetch_stagger_ms: 50,
            verbose: false,
            storage_path: None,
        }
    }
}

impl RtuConfig {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: parse_base_url(base_url)?,
            ..Default::default()
        })
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let base_url = std::env::var("RTU_BASE_URL").context("config: RTU_BASE_URL not set")?;
        let mut config = Self::new(&base_url)?;

        config.token = std::env::var("RTU_TOKEN").ok();
        if let Ok(device_id) = std::env::var("RTU_DEVICE_ID") {
            config.device_id = device_id;
        }
        if let Ok(path) = std::env::var("RTU_CHANNEL_PATH") {
            config.channel_path = path;
        }
        if let Some(ms) = env_number("RTU_RECONNECT_MS")? {
            config.reconnect_delay_ms = ms;
        }
        if let Some(ms) = env_number("RTU_REQUEST_TIMEOUT_MS")? {
            config.request_timeout_ms = ms;
        }
        if let Some(code) = env_number("RTU_PERMANENT_CLOSE_CODE")? {
            config.permanent_close_code =
                u16::try_from(code).context("config: RTU_PERMANENT_CLOSE_CODE out of range")?;
        }
        config.verbose = std::env::var("RTU_VERBOSE")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        config.storage_path = std::env::var("RTU_STORAGE_PATH").ok().map(PathBuf::from);

        Ok(config)
    }

    /// Load configuration from a TOML file; missing keys take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("config: failed to read {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("config: invalid {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        parse_base_url(config.base_url.as_str())?;
        Ok(config)
    }

    /// Channel URI: the HTTP base rewritten to its WebSocket scheme, the
    /// channel path appended and the token added as a query parameter.
    /// `None` when the base scheme has no channel equivalent.
    pub fn endpoint_uri(&self) -> Option<Url> {
        let scheme = match self.base_url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            _ => return None,
        };

        let mut url = self.base_url.clone();
        url.set_scheme(scheme).ok()?;
        if !self.channel_path.is_empty() {
            url.path_segments_mut()
                .ok()?
                .pop_if_empty()
                .extend(self.channel_path.split('/').filter(|s| !s.is_empty()));
        }
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Some(url)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect_delay_ms),
            backoff_multiplier: self.reconnect_multiplier,
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn fetch_stagger(&self) -> Duration {
        Duration::from_millis(self.fetch_stagger_ms)
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("config: invalid url {raw}"))?;
    if url.cannot_be_a_base() {
        bail!("config: {raw} cannot be used as a base url");
    }
    Ok(url)
}

fn env_number(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .with_context(|| format!("config: {key} is not a number")),
        Err(_) => Ok(None),
    }
}
