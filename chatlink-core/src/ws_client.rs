use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitStream, Stream, StreamExt};
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    http::{header::USER_AGENT, HeaderValue},
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{ChatLinkError, CoreResult};
use crate::transport::{CloseInfo, Connector, TransportEvent, TransportLink, WireCommand};

const DEFAULT_USER_AGENT: &str = "chatlink/0.1";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `Connector` over tokio-tungstenite: one WebSocket per `connect` call.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new_default()
    }
}

impl WsConnector {
    pub fn new_default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for WsConnector {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn connect(&self, endpoint: &str) -> CoreResult<TransportLink> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| connect_error(endpoint, format!("invalid endpoint: {e}")))?;
        request
            .headers_mut()
            .insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));

        let (ws, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| {
                    connect_error(
                        endpoint,
                        format!("timed out after {:?}", self.connect_timeout),
                    )
                })?
                .map_err(|e| map_ws_error(endpoint, e))?;

        let (mut sink, stream) = ws.split();
        let (outgoing, mut commands) = mpsc::unbounded_channel::<WireCommand>();

        tokio::spawn(async move {
            while let Some(cmd) = commands.recv().await {
                let (msg, last) = match cmd {
                    WireCommand::Text(text) => (Message::Text(text.into()), false),
                    WireCommand::Close { code, reason } => (
                        Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        })),
                        true,
                    ),
                };
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!(error = %e, "websocket write failed");
                    return;
                }
                if last {
                    return;
                }
            }
            // Every sender is gone: the manager dropped this link.
            let _ = sink.close().await;
        });

        Ok(TransportLink {
            outgoing,
            incoming: Box::pin(WsEvents::new(stream)),
        })
    }
}

fn connect_error(endpoint: &str, message: String) -> ChatLinkError {
    ChatLinkError::Connect {
        endpoint: endpoint.to_string(),
        message,
    }
}

fn map_ws_error(endpoint: &str, err: tungstenite::Error) -> ChatLinkError {
    let message = match &err {
        tungstenite::Error::Http(response) => {
            format!("handshake rejected with HTTP {}", response.status().as_u16())
        }
        tungstenite::Error::Io(io) => format!("io error: {} ({:?})", io, io.kind()),
        other => other.to_string(),
    };
    connect_error(endpoint, message)
}

/// Maps raw WebSocket messages to `TransportEvent`s. Ends after the first
/// terminal event.
struct WsEvents {
    inner: SplitStream<WsStream>,
    done: bool,
}

impl WsEvents {
    fn new(inner: SplitStream<WsStream>) -> Self {
        Self { inner, done: false }
    }
}

impl Stream for WsEvents {
    type Item = TransportEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        loop {
            match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(Message::Text(text)))) => {
                    return Poll::Ready(Some(TransportEvent::Message(text.as_str().to_owned())));
                }
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    return Poll::Ready(Some(TransportEvent::Message(text)));
                }
                Poll::Ready(Some(Ok(Message::Close(frame)))) => {
                    self.done = true;
                    let info = match frame {
                        Some(f) => CloseInfo::with_code(u16::from(f.code)),
                        // 1005: closed without a status code
                        None => CloseInfo::with_code(1005),
                    };
                    return Poll::Ready(Some(TransportEvent::Closed(info)));
                }
                // ping/pong are answered by tungstenite itself
                Poll::Ready(Some(Ok(_))) => continue,
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(TransportEvent::Error(e.to_string())));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    return Poll::Ready(Some(TransportEvent::Closed(CloseInfo::abnormal())));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
