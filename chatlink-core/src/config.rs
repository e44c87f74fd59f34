use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::error::{ChatLinkError, CoreResult};

fn default_endpoint() -> String {
    "ws://localhost:8000/ws".to_string()
}
fn default_true() -> bool {
    true
}
fn default_delay_ms() -> u64 {
    3_000
}
fn default_backoff_factor() -> f64 {
    1.0
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// Reconnection policy after an unclean close. Defaults: retry every 3s, forever.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReconnectCfg {
    /// Delay before the first reconnection attempt, in milliseconds.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Growth factor applied per consecutive failed attempt (1.0 = fixed delay).
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound for the grown delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Stop scheduling attempts after this many consecutive failures (None = never stop).
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectCfg {
    fn default() -> Self {
        Self {
            delay_ms: default_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: None,
        }
    }
}

impl ReconnectCfg {
    /// Delay before the retry that follows `retry` earlier retries; retry 0 waits `delay_ms`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.min(i32::MAX as u32) as i32;
        let grown = self.delay_ms as f64 * self.backoff_factor.powi(exp);
        let cap = self.max_delay_ms.max(self.delay_ms) as f64;
        Duration::from_millis(grown.min(cap) as u64)
    }

    /// Whether another attempt may be scheduled after `failed` consecutive failures.
    pub fn allows(&self, failed: u32) -> bool {
        self.max_attempts.is_none_or(|max| failed < max)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConnectionCfg {
    /// WebSocket endpoint, e.g. ws://localhost:8000/ws
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Close the transport cleanly once the last listener unsubscribes.
    #[serde(default = "default_true")]
    pub close_when_idle: bool,
    #[serde(default)]
    pub reconnect: ReconnectCfg,
}

impl Default for ConnectionCfg {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            close_when_idle: true,
            reconnect: ReconnectCfg::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatCfg {
    /// Model name forwarded with every request.
    #[serde(default = "default_model")]
    pub model: String,
    /// When set, requests use the persona `chat` form instead of `openai_chat`.
    #[serde(default)]
    pub persona_id: Option<String>,
}

impl Default for ChatCfg {
    fn default() -> Self {
        Self {
            model: default_model(),
            persona_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionCfg,
    #[serde(default)]
    pub chat: ChatCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| ChatLinkError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Self>(s)?,
            Some("toml") => toml::from_str::<Self>(s)?,
            _ => match serde_json::from_str::<Self>(s) {
                Ok(cfg) => cfg,
                Err(_) => toml::from_str::<Self>(s)?,
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CoreResult<()> {
        let ep = &self.connection.endpoint;
        if !(ep.starts_with("ws://") || ep.starts_with("wss://")) {
            return Err(ChatLinkError::Validation(format!(
                "endpoint '{ep}' must use ws:// or wss://"
            )));
        }
        let factor = self.connection.reconnect.backoff_factor;
        if !factor.is_finite() || factor < 1.0 {
            return Err(ChatLinkError::Validation(format!(
                "reconnect.backoff_factor must be >= 1.0, got {factor}"
            )));
        }
        if self.chat.model.trim().is_empty() {
            return Err(ChatLinkError::Validation("chat.model must not be empty".into()));
        }
        Ok(())
    }
}
