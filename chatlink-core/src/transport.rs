use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::error::CoreResult;

/// Normal closure code; a close with this code never triggers reconnection.
pub const CLOSE_NORMAL: u16 = 1000;
/// Reported when the transport dropped without a closing handshake.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// How a transport ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    /// Closing handshake completed as an intentional, normal close.
    pub clean: bool,
}

impl CloseInfo {
    pub fn normal() -> Self {
        Self {
            code: CLOSE_NORMAL,
            clean: true,
        }
    }

    pub fn abnormal() -> Self {
        Self {
            code: CLOSE_ABNORMAL,
            clean: false,
        }
    }

    pub fn with_code(code: u16) -> Self {
        Self {
            code,
            clean: code == CLOSE_NORMAL,
        }
    }

    /// Whether this close should be followed by a reconnection attempt.
    pub fn wants_reconnect(&self) -> bool {
        !self.clean && self.code != CLOSE_NORMAL
    }
}

/// What a live transport reports upward, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One text message as received.
    Message(String),
    /// The transport closed. Terminal.
    Closed(CloseInfo),
    /// The transport failed. Terminal; treated as an unclean close.
    Error(String),
}

/// What the manager asks a live transport to do.
#[derive(Debug, Clone, PartialEq)]
pub enum WireCommand {
    Text(String),
    Close { code: u16, reason: String },
}

/// An established transport: a command sink and an event stream.
/// Dropping both halves releases the underlying socket.
pub struct TransportLink {
    pub outgoing: mpsc::UnboundedSender<WireCommand>,
    pub incoming: BoxStream<'static, TransportEvent>,
}

/// Opens transports to an endpoint. The manager calls this once per attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn connect(&self, endpoint: &str) -> CoreResult<TransportLink>;
}
