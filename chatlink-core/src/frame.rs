//! Inbound frames of the streaming chat protocol.
//!
//! Contract:
//! - A reply is announced by `status` frames (`starting`, `processing`, `streaming`).
//! - While streaming, the server emits 0..n `chunk` frames with `is_final == false`,
//!   then exactly one `chunk` with `is_final == true` and usually empty text.
//! - A `response` frame with `status == completed` closes the request; it may carry
//!   the full text and a server-side `response_id` in `data`.
//! - An `error` frame may arrive at any point and ends the request.
//!
//! Frames carry no request id. Consumers must apply them in arrival order.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Starting,
    Processing,
    Streaming,
    Completed,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Completed,
    #[serde(other)]
    Other,
}

/// One decoded server message. Listeners only ever see `&Frame`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Status {
        status: StreamStatus,
        /// Human-readable progress text, e.g. "Sending request to OpenAI (gpt-4o)...".
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Chunk {
        #[serde(default)]
        chunk: String,
        #[serde(default)]
        is_final: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        persona_id: Option<String>,
    },
    Response {
        #[serde(default)]
        status: Option<ResponseStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Error)]
#[error("malformed frame: {0}")]
pub struct FrameError(#[from] serde_json::Error);

impl Frame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wire name of the frame type, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Chunk { .. } => "chunk",
            Self::Response { .. } => "response",
            Self::Error { .. } => "error",
        }
    }

    /// True for a `response` frame whose status is `completed`.
    pub fn is_completed_response(&self) -> bool {
        matches!(
            self,
            Self::Response {
                status: Some(ResponseStatus::Completed),
                ..
            }
        )
    }

    /// Full reply text carried by a `response` frame (`data.response`).
    pub fn response_text(&self) -> Option<&str> {
        self.response_field("response")
    }

    /// Server-side response id carried by a `response` frame (`data.response_id`).
    /// Empty ids are treated as absent.
    pub fn response_id(&self) -> Option<&str> {
        self.response_field("response_id").filter(|s| !s.is_empty())
    }

    fn response_field(&self, key: &str) -> Option<&str> {
        match self {
            Self::Response { data: Some(d), .. } => d.get(key).and_then(|v| v.as_str()),
            _ => None,
        }
    }
}
