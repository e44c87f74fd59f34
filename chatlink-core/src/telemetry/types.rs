use serde::{Deserialize, Serialize};

/// Lifecycle step a `ConnectionTrace` describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    Opened,
    Failed,
    Closed,
}

/// One connection lifecycle record: an attempt that opened or failed, or a
/// live transport that closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTrace {
    pub event: ConnectionEvent,

    /// Endpoint URL the transport was opened against.
    pub endpoint: String,

    /// Connector name, e.g. "websocket".
    pub connector: Option<String>,

    /// 1-based attempt number since the last successful open.
    pub attempt: Option<u32>,

    /// Close code reported by the transport (closed events only).
    pub close_code: Option<u16>,

    /// Whether a reconnect was scheduled as a consequence of this event.
    pub reconnect_scheduled: bool,

    /// Time spent establishing the transport, in milliseconds.
    pub latency_ms: Option<u64>,

    pub error_message: Option<String>,
}

impl ConnectionTrace {
    pub fn new(event: ConnectionEvent, endpoint: impl Into<String>) -> Self {
        Self {
            event,
            endpoint: endpoint.into(),
            connector: None,
            attempt: None,
            close_code: None,
            reconnect_scheduled: false,
            latency_ms: None,
            error_message: None,
        }
    }

    pub fn connector(mut self, name: &str) -> Self {
        self.connector = Some(name.to_string());
        self
    }
    pub fn attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }
    pub fn close_code(mut self, code: u16) -> Self {
        self.close_code = Some(code);
        self
    }
    pub fn reconnect_scheduled(mut self, scheduled: bool) -> Self {
        self.reconnect_scheduled = scheduled;
        self
    }
    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }
    pub fn error_message(mut self, msg: &str) -> Self {
        self.error_message = Some(msg.to_string());
        self
    }
}

/// Structured record of a finalized assistant turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TurnLog {
    pub turn_id: Option<String>,
    pub model: Option<String>,
    pub persona_id: Option<String>,

    /// True when the text arrived as chunks rather than one response frame.
    pub streamed: bool,
    pub chunks: u32,
    pub chars: usize,

    /// From request transmission to finalization.
    pub latency_ms: Option<u64>,
}

impl TurnLog {
    pub fn new() -> Self { Self::default() }
    pub fn turn_id(mut self, v: &str) -> Self { self.turn_id = Some(v.to_string()); self }
    pub fn model(mut self, v: &str) -> Self { self.model = Some(v.to_string()); self }
    pub fn persona_id_opt(mut self, v: Option<&str>) -> Self { self.persona_id = v.map(|s| s.to_string()); self }
    pub fn streamed(mut self, chunks: u32) -> Self { self.streamed = true; self.chunks = chunks; self }
    pub fn text(mut self, v: &str) -> Self { self.chars = v.chars().count(); self }
    pub fn latency_ms_opt(mut self, v: Option<u64>) -> Self { self.latency_ms = v; self }
}
