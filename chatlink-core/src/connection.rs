//! One logical streaming connection per manager instance.
//!
//! The manager owns establishment, teardown, reconnection, and fan-out of
//! inbound frames. All state lives behind one `std::sync::Mutex`; the lock is
//! never held across an `.await` or while listener callbacks run.
//!
//! Every attempt and every live transport is stamped with a generation
//! number. Tasks belonging to an older generation are detached: their results
//! and events are ignored (and a late-opened link is closed immediately).

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::ConnectionCfg;
use crate::error::{ChatLinkError, CoreResult};
use crate::frame::Frame;
use crate::telemetry::{self, ConnectionEvent, ConnectionTrace};
use crate::transport::{CLOSE_NORMAL, CloseInfo, Connector, TransportEvent, TransportLink, WireCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    /// A clean close was requested locally; waiting for the transport to end.
    Closing,
}

/// Receives every inbound frame. Called on the connection's reader task, in
/// transport order; implementations must not block.
pub trait FrameListener: Send + Sync + 'static {
    fn on_frame(&self, frame: &Frame);

    /// The transport this listener was receiving from went away. Default no-op.
    fn on_connection_lost(&self) {}
}

impl<F> FrameListener for F
where
    F: Fn(&Frame) + Send + Sync + 'static,
{
    fn on_frame(&self, frame: &Frame) {
        self(frame)
    }
}

/// Cloneable outcome of one attempt, shared by every coalesced waiter.
#[derive(Debug, Clone)]
enum AttemptFailure {
    Connect { endpoint: String, message: String },
    ShutDown,
    Superseded { endpoint: String },
}

impl From<AttemptFailure> for ChatLinkError {
    fn from(f: AttemptFailure) -> Self {
        match f {
            AttemptFailure::Connect { endpoint, message } => ChatLinkError::Connect { endpoint, message },
            AttemptFailure::ShutDown => ChatLinkError::ShutDown,
            AttemptFailure::Superseded { endpoint } => ChatLinkError::Superseded { endpoint },
        }
    }
}

type AttemptOutcome = Result<(), AttemptFailure>;
type PendingAttempt = Shared<BoxFuture<'static, AttemptOutcome>>;

struct ListenerSlot {
    id: u64,
    listener: Weak<dyn FrameListener>,
}

struct Inner {
    endpoint: Option<String>,
    state: ConnectionState,
    generation: u64,
    outgoing: Option<mpsc::UnboundedSender<WireCommand>>,
    pending: Option<PendingAttempt>,
    resolve: Option<oneshot::Sender<AttemptOutcome>>,
    listeners: Vec<ListenerSlot>,
    next_listener_id: u64,
    reconnect: Option<CancellationToken>,
    /// Consecutive failed attempts since the last successful open.
    failed_attempts: u32,
    /// The last listener left while an attempt was in flight.
    idle_on_open: bool,
}

impl Inner {
    fn live_listeners(&mut self) -> Vec<Arc<dyn FrameListener>> {
        self.listeners.retain(|slot| slot.listener.strong_count() > 0);
        self.listeners
            .iter()
            .filter_map(|slot| slot.listener.upgrade())
            .collect()
    }

    fn cancel_reconnect(&mut self) {
        if let Some(token) = self.reconnect.take() {
            token.cancel();
        }
    }

    fn settle_attempt(&mut self, outcome: AttemptOutcome) {
        self.pending = None;
        if let Some(tx) = self.resolve.take() {
            let _ = tx.send(outcome);
        }
    }

    /// Ask the live transport to close with code 1000 and stop treating it as current.
    fn detach_transport(&mut self, reason: &str) {
        if let Some(tx) = self.outgoing.take() {
            let _ = tx.send(WireCommand::Close {
                code: CLOSE_NORMAL,
                reason: reason.to_string(),
            });
        }
    }
}

struct ManagerShared {
    connector: Arc<dyn Connector>,
    cfg: ConnectionCfg,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Cheap, cloneable handle to one managed connection. Construct one per
/// process (or per test) and hand clones to consumers.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, cfg: ConnectionCfg) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(ManagerShared {
                connector,
                cfg,
                inner: Mutex::new(Inner {
                    endpoint: None,
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    outgoing: None,
                    pending: None,
                    resolve: None,
                    listeners: Vec::new(),
                    next_listener_id: 0,
                    reconnect: None,
                    failed_attempts: 0,
                    idle_on_open: false,
                }),
                state_tx,
            }),
        }
    }

    pub fn config(&self) -> &ConnectionCfg {
        &self.shared.cfg
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Follow state changes, e.g. to render a connected/connecting indicator.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        let mut inner = self.lock();
        inner.listeners.retain(|slot| slot.listener.strong_count() > 0);
        inner.listeners.len()
    }

    /// Make sure a transport to `endpoint` is open or being opened.
    ///
    /// Resolves `Ok` once the connection is Open. Callers arriving while an
    /// attempt to the same endpoint is in flight share that attempt. Dropping
    /// the returned future only stops waiting; the attempt keeps running.
    /// A different endpoint replaces the current transport.
    pub fn ensure_connected(&self, endpoint: &str) -> impl Future<Output = CoreResult<()>> + Send + use<> {
        let (pending, lost) = {
            let mut inner = self.lock();
            self.begin(&mut inner, endpoint)
        };
        notify_lost(&lost);
        async move {
            match pending {
                None => Ok(()),
                Some(attempt) => attempt.await.map_err(ChatLinkError::from),
            }
        }
    }

    /// Register a listener for every inbound frame. The manager keeps only a
    /// weak reference; the caller owns `listener` and the returned token.
    pub fn subscribe<L: FrameListener>(&self, listener: &Arc<L>) -> Subscription {
        let weak: Weak<dyn FrameListener> = Arc::downgrade(listener) as Weak<dyn FrameListener>;
        let mut inner = self.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push(ListenerSlot { id, listener: weak });
        inner.idle_on_open = false;
        debug!(listener = id, total = inner.listeners.len(), "listener subscribed");
        Subscription {
            manager: Arc::downgrade(&self.shared),
            id,
            active: true,
        }
    }

    /// Serialize `payload` and transmit it iff the connection is Open.
    /// Returns `false` otherwise; nothing is queued or retried.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> bool {
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "payload failed to serialize");
                return false;
            }
        };
        let inner = self.lock();
        if inner.state != ConnectionState::Open {
            debug!(state = ?inner.state, "send while not open");
            return false;
        }
        match &inner.outgoing {
            Some(tx) => tx.send(WireCommand::Text(text)).is_ok(),
            None => false,
        }
    }

    /// Close cleanly (code 1000), cancel any pending reconnect, and fail
    /// in-flight attempts with `ShutDown`. Listeners stay registered; a later
    /// `ensure_connected` starts over.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.cancel_reconnect();
        inner.failed_attempts = 0;
        inner.idle_on_open = false;
        inner.settle_attempt(Err(AttemptFailure::ShutDown));
        match inner.state {
            ConnectionState::Open => {
                inner.detach_transport("shutdown");
                self.set_state(&mut inner, ConnectionState::Closing);
            }
            ConnectionState::Connecting => {
                inner.generation += 1;
                self.set_state(&mut inner, ConnectionState::Disconnected);
            }
            ConnectionState::Closing | ConnectionState::Disconnected => {}
        }
        info!("connection manager shut down");
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            debug!(from = ?inner.state, to = ?state, "connection state");
            inner.state = state;
            self.shared.state_tx.send_replace(state);
        }
    }

    /// Decide, under the lock, whether `endpoint` needs a new attempt.
    fn begin(&self, inner: &mut Inner, endpoint: &str) -> (Option<PendingAttempt>, Vec<Arc<dyn FrameListener>>) {
        let same = inner.endpoint.as_deref() == Some(endpoint);
        let mut lost = Vec::new();
        match inner.state {
            ConnectionState::Open if same => return (None, lost),
            ConnectionState::Connecting if same => {
                if let Some(pending) = &inner.pending {
                    return (Some(pending.clone()), lost);
                }
            }
            ConnectionState::Open => {
                info!(from = ?inner.endpoint, to = endpoint, "switching endpoint");
                inner.detach_transport("endpoint changed");
                lost = inner.live_listeners();
            }
            ConnectionState::Connecting => {
                let previous = inner.endpoint.clone().unwrap_or_default();
                inner.settle_attempt(Err(AttemptFailure::Superseded { endpoint: previous }));
            }
            // The closing transport's Closed event will belong to a stale
            // generation, so listeners hear about the loss now.
            ConnectionState::Closing => lost = inner.live_listeners(),
            ConnectionState::Disconnected => {}
        }
        if !same {
            inner.failed_attempts = 0;
        }
        inner.cancel_reconnect();
        (Some(self.start_attempt(inner, endpoint)), lost)
    }

    fn start_attempt(&self, inner: &mut Inner, endpoint: &str) -> PendingAttempt {
        inner.generation += 1;
        let generation = inner.generation;
        inner.endpoint = Some(endpoint.to_string());
        inner.outgoing = None;
        self.set_state(inner, ConnectionState::Connecting);

        let (tx, rx) = oneshot::channel();
        let pending = rx
            .map(|r| r.unwrap_or(Err(AttemptFailure::ShutDown)))
            .boxed()
            .shared();
        inner.resolve = Some(tx);
        inner.pending = Some(pending.clone());

        let attempt = inner.failed_attempts + 1;
        let connector = self.shared.connector.clone();
        let weak = Arc::downgrade(&self.shared);
        let endpoint = endpoint.to_string();
        let span = info_span!(
            "chatlink.connect",
            conn.endpoint = %endpoint,
            conn.connector = connector.name(),
            conn.attempt = attempt,
            conn.outcome = tracing::field::Empty,
        );
        tokio::spawn(
            async move {
                let started = Instant::now();
                let result = connector.connect(&endpoint).await;
                let latency_ms = started.elapsed().as_millis() as u64;
                match weak.upgrade() {
                    Some(shared) => ConnectionManager { shared }.finish_attempt(generation, attempt, result, latency_ms),
                    None => {
                        if let Ok(link) = result {
                            close_link(&link, "manager dropped");
                        }
                    }
                }
            }
            .instrument(span),
        );
        pending
    }

    fn finish_attempt(&self, generation: u64, attempt: u32, result: CoreResult<TransportLink>, latency_ms: u64) {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != ConnectionState::Connecting {
            if let Ok(link) = result {
                debug!("attempt finished after being superseded; closing its transport");
                close_link(&link, "superseded");
            }
            tracing::Span::current().record("conn.outcome", "superseded");
            return;
        }
        let endpoint = inner.endpoint.clone().unwrap_or_default();
        let connector = self.shared.connector.name().to_string();
        let idle = std::mem::take(&mut inner.idle_on_open) && inner.live_listeners().is_empty();
        match result {
            Ok(link) => {
                let TransportLink { outgoing, incoming } = link;
                inner.outgoing = Some(outgoing);
                inner.failed_attempts = 0;
                self.set_state(&mut inner, ConnectionState::Open);
                inner.settle_attempt(Ok(()));
                tracing::Span::current().record("conn.outcome", "open");
                info!(latency.ms = latency_ms, "connection open");
                telemetry::emit(
                    ConnectionTrace::new(ConnectionEvent::Opened, &endpoint)
                        .connector(&connector)
                        .attempt(attempt)
                        .latency_ms(latency_ms),
                );
                tokio::spawn(run_reader(Arc::downgrade(&self.shared), generation, incoming));
                if idle {
                    info!("no listeners left; closing connection");
                    inner.detach_transport("idle");
                    self.set_state(&mut inner, ConnectionState::Closing);
                }
            }
            Err(e) => {
                let message = match &e {
                    ChatLinkError::Connect { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                inner.failed_attempts = inner.failed_attempts.saturating_add(1);
                self.set_state(&mut inner, ConnectionState::Disconnected);
                inner.settle_attempt(Err(AttemptFailure::Connect {
                    endpoint: endpoint.clone(),
                    message: message.clone(),
                }));
                tracing::Span::current().record("conn.outcome", "failed");
                let scheduled = !idle && self.schedule_reconnect(&mut inner);
                warn!(error.message = %message, reconnect = scheduled, "connection attempt failed");
                telemetry::emit(
                    ConnectionTrace::new(ConnectionEvent::Failed, &endpoint)
                        .connector(&connector)
                        .attempt(attempt)
                        .latency_ms(latency_ms)
                        .reconnect_scheduled(scheduled)
                        .error_message(&message),
                );
            }
        }
    }

    /// Arm a single delayed reconnection attempt. Returns whether one was armed.
    fn schedule_reconnect(&self, inner: &mut Inner) -> bool {
        let policy = &self.shared.cfg.reconnect;
        if !policy.allows(inner.failed_attempts) {
            warn!(failed = inner.failed_attempts, "giving up on reconnection");
            return false;
        }
        let Some(endpoint) = inner.endpoint.clone() else {
            return false;
        };
        inner.cancel_reconnect();
        let token = CancellationToken::new();
        inner.reconnect = Some(token.clone());
        // An unclean close (0 failures) and a first failed attempt (1) both get the base delay.
        let delay = policy.delay_for(inner.failed_attempts.saturating_sub(1));
        debug!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");

        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(shared) = weak.upgrade() {
                        ConnectionManager { shared }.reconnect_now(&token, &endpoint);
                    }
                }
            }
        });
        true
    }

    fn reconnect_now(&self, token: &CancellationToken, endpoint: &str) {
        let mut inner = self.lock();
        if token.is_cancelled() || inner.state != ConnectionState::Disconnected {
            return;
        }
        inner.reconnect = None;
        info!(endpoint, "reconnecting");
        // Nobody awaits a reconnect; the shared future is simply dropped.
        drop(self.start_attempt(&mut inner, endpoint));
    }

    fn dispatch(&self, generation: u64, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return;
            }
        };
        let listeners = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            inner.live_listeners()
        };
        debug!(kind = frame.kind(), listeners = listeners.len(), "frame received");
        for listener in &listeners {
            listener.on_frame(&frame);
        }
    }

    fn handle_closed(&self, generation: u64, close: CloseInfo, error: Option<&str>) {
        let lost = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            let requested = inner.state == ConnectionState::Closing;
            inner.outgoing = None;
            self.set_state(&mut inner, ConnectionState::Disconnected);
            let scheduled = !requested && close.wants_reconnect() && self.schedule_reconnect(&mut inner);
            match error {
                Some(error) => warn!(error.message = error, reconnect = scheduled, "transport failed"),
                None if requested || !close.wants_reconnect() => {
                    info!(close.code = close.code, "connection closed")
                }
                None => warn!(close.code = close.code, reconnect = scheduled, "connection closed uncleanly"),
            }
            let endpoint = inner.endpoint.clone().unwrap_or_default();
            let mut trace = ConnectionTrace::new(ConnectionEvent::Closed, endpoint)
                .connector(self.shared.connector.name())
                .close_code(close.code)
                .reconnect_scheduled(scheduled);
            if let Some(error) = error {
                trace = trace.error_message(error);
            }
            telemetry::emit(trace);
            inner.live_listeners()
        };
        notify_lost(&lost);
    }

    fn unsubscribe(&self, id: u64) {
        let mut inner = self.lock();
        inner.listeners.retain(|slot| slot.id != id && slot.listener.strong_count() > 0);
        debug!(listener = id, remaining = inner.listeners.len(), "listener unsubscribed");
        if inner.listeners.is_empty() && self.shared.cfg.close_when_idle {
            inner.cancel_reconnect();
            match inner.state {
                ConnectionState::Open => {
                    info!("last listener gone; closing connection");
                    inner.detach_transport("idle");
                    self.set_state(&mut inner, ConnectionState::Closing);
                }
                ConnectionState::Connecting => inner.idle_on_open = true,
                ConnectionState::Closing | ConnectionState::Disconnected => {}
            }
        }
    }
}

fn notify_lost(listeners: &[Arc<dyn FrameListener>]) {
    for listener in listeners {
        listener.on_connection_lost();
    }
}

fn close_link(link: &TransportLink, reason: &str) {
    let _ = link.outgoing.send(WireCommand::Close {
        code: CLOSE_NORMAL,
        reason: reason.to_string(),
    });
}

/// Reads one transport until it ends, applying events in arrival order.
async fn run_reader(manager: Weak<ManagerShared>, generation: u64, mut incoming: BoxStream<'static, TransportEvent>) {
    while let Some(event) = incoming.next().await {
        let Some(shared) = manager.upgrade() else {
            return;
        };
        let manager = ConnectionManager { shared };
        match event {
            TransportEvent::Message(text) => manager.dispatch(generation, &text),
            TransportEvent::Closed(close) => {
                manager.handle_closed(generation, close, None);
                return;
            }
            TransportEvent::Error(error) => {
                manager.handle_closed(generation, CloseInfo::abnormal(), Some(&error));
                return;
            }
        }
    }
    if let Some(shared) = manager.upgrade() {
        ConnectionManager { shared }.handle_closed(generation, CloseInfo::abnormal(), None);
    }
}

/// Registration token returned by `ConnectionManager::subscribe`. Dropping it
/// unsubscribes.
pub struct Subscription {
    manager: Weak<ManagerShared>,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        if let Some(shared) = self.manager.upgrade() {
            ConnectionManager { shared }.unsubscribe(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).field("active", &self.active).finish()
    }
}
