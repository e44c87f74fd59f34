//! In-memory transport and listener doubles for unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::connection::FrameListener;
use crate::error::{ChatLinkError, CoreResult};
use crate::frame::Frame;
use crate::transport::{CloseInfo, Connector, TransportEvent, TransportLink, WireCommand};

/// Let spawned tasks run. With paused time this also advances the clock by 1ms.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

struct MockLink {
    events: mpsc::UnboundedSender<TransportEvent>,
    sent: Arc<Mutex<Vec<WireCommand>>>,
}

#[derive(Default)]
struct MockState {
    endpoints: Vec<String>,
    links: Vec<MockLink>,
    fail_next: u32,
    delay: Option<Duration>,
}

/// Connector whose transports are driven by the test. Every `connect` is
/// recorded; event helpers act on the most recent transport. A `Close`
/// command is echoed back as `Closed` with the same code, like a server would.
#[derive(Default)]
pub struct MockConnector {
    state: Mutex<MockState>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().endpoints.len()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.state.lock().unwrap().endpoints.clone()
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().unwrap().fail_next = n;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    fn push(&self, event: TransportEvent) {
        let state = self.state.lock().unwrap();
        let link = state.links.last().expect("no transport opened yet");
        let _ = link.events.send(event);
    }

    pub fn push_text(&self, text: &str) {
        self.push(TransportEvent::Message(text.to_string()));
    }

    pub fn push_frame(&self, frame: serde_json::Value) {
        self.push(TransportEvent::Message(frame.to_string()));
    }

    pub fn close(&self, info: CloseInfo) {
        self.push(TransportEvent::Closed(info));
    }

    pub fn error(&self, message: &str) {
        self.push(TransportEvent::Error(message.to_string()));
    }

    /// Commands written to the most recent transport.
    pub fn sent(&self) -> Vec<WireCommand> {
        let state = self.state.lock().unwrap();
        state
            .links
            .last()
            .map(|l| l.sent.lock().unwrap().clone())
            .unwrap_or_default()
    }

    /// Text payloads written to the most recent transport, parsed as JSON.
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent()
            .into_iter()
            .filter_map(|cmd| match cmd {
                WireCommand::Text(t) => serde_json::from_str(&t).ok(),
                WireCommand::Close { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self, endpoint: &str) -> CoreResult<TransportLink> {
        let (delay, fail) = {
            let mut state = self.state.lock().unwrap();
            state.endpoints.push(endpoint.to_string());
            let fail = state.fail_next > 0;
            if fail {
                state.fail_next -= 1;
            }
            (state.delay, fail)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(ChatLinkError::Connect {
                endpoint: endpoint.to_string(),
                message: "connection refused".into(),
            });
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let (outgoing, mut commands) = mpsc::unbounded_channel::<WireCommand>();
        let sent = Arc::new(Mutex::new(Vec::new()));

        let echo = events_tx.clone();
        let log = sent.clone();
        tokio::spawn(async move {
            while let Some(cmd) = commands.recv().await {
                let close = match &cmd {
                    WireCommand::Close { code, .. } => Some(*code),
                    WireCommand::Text(_) => None,
                };
                log.lock().unwrap().push(cmd);
                if let Some(code) = close {
                    let _ = echo.send(TransportEvent::Closed(CloseInfo::with_code(code)));
                    return;
                }
            }
        });

        self.state.lock().unwrap().links.push(MockLink {
            events: events_tx,
            sent,
        });

        let incoming = futures::stream::unfold(events_rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed();
        Ok(TransportLink { outgoing, incoming })
    }
}

/// Listener that records every frame and connection-loss notification.
#[derive(Default)]
pub struct Recorder {
    frames: Mutex<Vec<Frame>>,
    lost: Mutex<u32>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn lost(&self) -> u32 {
        *self.lost.lock().unwrap()
    }
}

impl FrameListener for Recorder {
    fn on_frame(&self, frame: &Frame) {
        self.frames.lock().unwrap().push(frame.clone());
    }

    fn on_connection_lost(&self) {
        *self.lost.lock().unwrap() += 1;
    }
}
