//! Chat session: turns the frame sequence of one connection into transcript
//! updates, and user intents into request frames.
//!
//! Phases: `Idle` -> `AwaitingResponse` (request sent or server starting) ->
//! `Streaming` (chunks accumulating) -> `Idle`. Frames that make no sense in
//! the current phase are ignored. The protocol has no request ids, so a
//! session allows one request in flight at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::ChatCfg;
use crate::connection::{ConnectionManager, FrameListener, Subscription};
use crate::error::SessionError;
use crate::frame::{Frame, StreamStatus};
use crate::model::{ClientFrame, ConversationTurn, OpenAiChatData, PersonaChatData, Role, TurnId};
use crate::normalizer::normalize_input;
use crate::telemetry::{self, TurnLog};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    AwaitingResponse,
    Streaming,
}

/// What a UI layer needs to re-render or notify.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PhaseChanged(SessionPhase),
    /// Text appended to the streaming turn.
    Delta { turn: TurnId, text: String },
    TurnAppended(ConversationTurn),
    /// Transcript was cut back to `len` turns by a retry.
    TranscriptTruncated { len: usize },
    /// User-visible failure, e.g. an error frame or a dropped connection.
    Failure(String),
    /// Progress text sent by the server with a status frame.
    Notice(String),
}

struct Accumulator {
    turn: TurnId,
    text: String,
    chunks: u32,
}

struct SessionState {
    phase: SessionPhase,
    transcript: Vec<ConversationTurn>,
    stream: Option<Accumulator>,
    request_started: Option<Instant>,
}

struct SessionShared {
    manager: ConnectionManager,
    cfg: ChatCfg,
    state: Mutex<SessionState>,
    next_turn: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

/// One conversation over a shared `ConnectionManager`. Dropping the session
/// unsubscribes it.
pub struct ChatSession {
    shared: Arc<SessionShared>,
    _subscription: Subscription,
}

impl ChatSession {
    pub fn new(manager: ConnectionManager, cfg: ChatCfg) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(SessionShared {
            manager: manager.clone(),
            cfg,
            state: Mutex::new(SessionState {
                phase: SessionPhase::Idle,
                transcript: Vec::new(),
                stream: None,
                request_started: None,
            }),
            next_turn: AtomicU64::new(1),
            events,
        });
        let subscription = manager.subscribe(&shared);
        Self {
            shared,
            _subscription: subscription,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.lock().phase
    }

    pub fn transcript(&self) -> Vec<ConversationTurn> {
        self.shared.lock().transcript.clone()
    }

    /// Text received so far for the turn being streamed, if any.
    pub fn streaming_content(&self) -> Option<String> {
        self.shared.lock().stream.as_ref().map(|acc| acc.text.clone())
    }

    /// Append a user turn and transmit it as a request.
    ///
    /// The turn is added before transmission and removed again if the
    /// connection refuses the frame; rejected input is handed back in the error.
    pub fn send(&self, text: &str) -> Result<TurnId, SessionError> {
        let input = normalize_input(text);
        if input.is_empty() {
            return Err(SessionError::EmptyInput);
        }
        let shared = &self.shared;
        let mut st = shared.lock();
        if st.phase != SessionPhase::Idle {
            return Err(SessionError::Busy { input });
        }
        if !shared.manager.is_open() {
            shared.notify(SessionEvent::Failure("not connected".into()));
            return Err(SessionError::NotConnected { input });
        }

        let previous = last_response_id(&st.transcript);
        let id = shared.allocate_turn();
        st.transcript.push(ConversationTurn::user(id, input.clone()));
        if !shared.manager.send(&shared.request(&input, previous)) {
            st.transcript.pop();
            shared.notify(SessionEvent::Failure("failed to send message".into()));
            return Err(SessionError::TransmitFailed { input });
        }

        debug!(turn = %id, "message sent");
        if let Some(turn) = st.transcript.last() {
            shared.notify(SessionEvent::TurnAppended(turn.clone()));
        }
        st.request_started = Some(Instant::now());
        shared.set_phase(&mut st, SessionPhase::AwaitingResponse);
        Ok(id)
    }

    /// Regenerate the reply at `turn_id`: drop it and everything after it,
    /// then re-send the user turn that precedes it.
    pub fn retry(&self, turn_id: TurnId) -> Result<(), SessionError> {
        let shared = &self.shared;
        let mut st = shared.lock();
        let idx = st
            .transcript
            .iter()
            .position(|t| t.id == turn_id)
            .ok_or(SessionError::UnknownTurn(turn_id))?;
        let prompt = match idx.checked_sub(1).map(|i| &st.transcript[i]) {
            Some(turn) if turn.role == Role::User => turn.content.clone(),
            _ => return Err(SessionError::NoPrecedingUserTurn(turn_id)),
        };
        if st.phase != SessionPhase::Idle {
            return Err(SessionError::Busy { input: prompt });
        }
        if !shared.manager.is_open() {
            shared.notify(SessionEvent::Failure("not connected".into()));
            return Err(SessionError::NotConnected { input: prompt });
        }

        let previous = last_response_id(&st.transcript[..idx - 1]);
        let removed: Vec<ConversationTurn> = st.transcript.drain(idx..).collect();
        if !shared.manager.send(&shared.request(&prompt, previous)) {
            st.transcript.extend(removed);
            shared.notify(SessionEvent::Failure("failed to send message".into()));
            return Err(SessionError::TransmitFailed { input: prompt });
        }

        info!(turn = %turn_id, dropped = removed.len(), "retrying");
        shared.notify(SessionEvent::TranscriptTruncated { len: idx });
        st.request_started = Some(Instant::now());
        shared.set_phase(&mut st, SessionPhase::AwaitingResponse);
        Ok(())
    }
}

fn last_response_id(turns: &[ConversationTurn]) -> Option<String> {
    turns
        .iter()
        .rev()
        .find(|t| t.role == Role::Assistant)
        .and_then(|t| t.response_id.clone())
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate_turn(&self) -> TurnId {
        TurnId(self.next_turn.fetch_add(1, Ordering::Relaxed))
    }

    fn notify(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn set_phase(&self, st: &mut SessionState, phase: SessionPhase) {
        if st.phase != phase {
            st.phase = phase;
            self.notify(SessionEvent::PhaseChanged(phase));
        }
    }

    fn request(&self, text: &str, previous_response_id: Option<String>) -> ClientFrame {
        match &self.cfg.persona_id {
            Some(persona_id) => ClientFrame::PersonaChat(PersonaChatData {
                message: text.to_string(),
                persona_id: persona_id.clone(),
                model: self.cfg.model.clone(),
                previous_response_id,
            }),
            None => ClientFrame::OpenAiChat(OpenAiChatData {
                input_text: text.to_string(),
                model: self.cfg.model.clone(),
                previous_response_id,
            }),
        }
    }

    fn apply(&self, st: &mut SessionState, frame: &Frame) {
        match frame {
            Frame::Status { status, message } => {
                if let Some(message) = message {
                    self.notify(SessionEvent::Notice(message.clone()));
                }
                match status {
                    StreamStatus::Starting | StreamStatus::Processing => {
                        if st.phase != SessionPhase::Streaming {
                            self.set_phase(st, SessionPhase::AwaitingResponse);
                        }
                    }
                    StreamStatus::Streaming => {
                        st.stream = Some(Accumulator {
                            turn: self.allocate_turn(),
                            text: String::new(),
                            chunks: 0,
                        });
                        self.set_phase(st, SessionPhase::Streaming);
                    }
                    StreamStatus::Completed => {
                        if st.phase != SessionPhase::Streaming {
                            self.set_phase(st, SessionPhase::Idle);
                        }
                    }
                    StreamStatus::Other => {}
                }
            }
            Frame::Chunk { chunk, is_final, .. } => {
                if st.phase != SessionPhase::Streaming {
                    debug!("chunk outside of a stream; ignored");
                    return;
                }
                let Some(acc) = st.stream.as_mut() else {
                    return;
                };
                if !chunk.is_empty() {
                    acc.text.push_str(chunk);
                    acc.chunks += 1;
                    let delta = SessionEvent::Delta {
                        turn: acc.turn,
                        text: chunk.clone(),
                    };
                    self.notify(delta);
                }
                if *is_final {
                    self.finalize_stream(st);
                    self.set_phase(st, SessionPhase::Idle);
                }
            }
            Frame::Error { message } => {
                warn!(error = %message, "server reported an error");
                st.stream = None;
                st.request_started = None;
                let text = if message.is_empty() { "unknown error" } else { message.as_str() };
                self.notify(SessionEvent::Failure(text.to_string()));
                self.set_phase(st, SessionPhase::Idle);
            }
            Frame::Response { .. } if frame.is_completed_response() => {
                match st.phase {
                    SessionPhase::Streaming => self.finalize_stream(st),
                    SessionPhase::AwaitingResponse => {
                        if let Some(text) = frame.response_text().filter(|t| !t.is_empty()) {
                            let turn = ConversationTurn::assistant(self.allocate_turn(), text);
                            self.log_turn(st, &turn, None);
                            self.append(st, turn);
                        }
                    }
                    SessionPhase::Idle => {}
                }
                if let Some(response_id) = frame.response_id() {
                    if let Some(turn) = st.transcript.iter_mut().rev().find(|t| t.role == Role::Assistant) {
                        turn.response_id = Some(response_id.to_string());
                    }
                }
                st.request_started = None;
                self.set_phase(st, SessionPhase::Idle);
            }
            Frame::Response { .. } => {}
        }
    }

    /// Turn the accumulator into a transcript turn. Empty streams leave no turn.
    fn finalize_stream(&self, st: &mut SessionState) {
        let Some(acc) = st.stream.take() else {
            return;
        };
        if acc.text.is_empty() {
            debug!(turn = %acc.turn, "empty stream finalized without a turn");
            return;
        }
        let turn = ConversationTurn::assistant(acc.turn, acc.text);
        self.log_turn(st, &turn, Some(acc.chunks));
        self.append(st, turn);
    }

    fn append(&self, st: &mut SessionState, turn: ConversationTurn) {
        self.notify(SessionEvent::TurnAppended(turn.clone()));
        st.transcript.push(turn);
    }

    fn log_turn(&self, st: &SessionState, turn: &ConversationTurn, chunks: Option<u32>) {
        let latency_ms = st.request_started.map(|t| t.elapsed().as_millis() as u64);
        let mut log = TurnLog::new()
            .turn_id(&turn.id.to_string())
            .model(&self.cfg.model)
            .persona_id_opt(self.cfg.persona_id.as_deref())
            .text(&turn.content)
            .latency_ms_opt(latency_ms);
        if let Some(chunks) = chunks {
            log = log.streamed(chunks);
        }
        debug!(turn = %turn.id, chars = log.chars, "assistant turn finalized");
        telemetry::emit_turn(log);
    }
}

impl FrameListener for SessionShared {
    fn on_frame(&self, frame: &Frame) {
        let mut st = self.lock();
        self.apply(&mut st, frame);
    }

    fn on_connection_lost(&self) {
        let mut st = self.lock();
        if st.phase == SessionPhase::Idle {
            return;
        }
        st.stream = None;
        st.request_started = None;
        self.notify(SessionEvent::Failure("connection lost".into()));
        self.set_phase(&mut st, SessionPhase::Idle);
    }
}
