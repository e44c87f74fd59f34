//! Telemetry primitives for connection lifecycle and chat turns.
//! By default, no telemetry is emitted unless a sink is installed via `set_telemetry_sink`.

pub mod keys;
pub mod types;
#[cfg(test)]
pub mod test_span;

pub use keys::*;
pub use types::*;

use std::sync::Arc;

use once_cell::sync::OnceCell;

/// Implement this to receive telemetry events.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`) and `'static`.
/// - `record` **may** be called from any thread; implementations should avoid panicking.
/// - Calls happen on the connection's reader task; keep them cheap.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, trace: ConnectionTrace);

    /// Finalized assistant turns. Default no-op.
    fn record_turn(&self, _log: TurnLog) {}
}

static TELEMETRY_SINK: OnceCell<Arc<dyn TelemetrySink>> = OnceCell::new();

// In tests, gate emission to only the calling test thread to avoid cross-test interference.
#[cfg(test)]
thread_local! {
    static TEST_CAPTURE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Install a global telemetry sink. Returns `false` if a sink is already installed.
///
/// This is a write-once global for the process lifetime (backed by `OnceCell`).
pub fn set_telemetry_sink(sink: Arc<dyn TelemetrySink>) -> bool {
    TELEMETRY_SINK.set(sink).is_ok()
}

#[cfg(test)]
fn capture_enabled() -> bool {
    TEST_CAPTURE.with(|c| c.get())
}

#[cfg(not(test))]
#[inline]
fn capture_enabled() -> bool {
    true
}

/// Emit a connection trace if a sink is installed.
///
/// In tests, emission is suppressed unless enabled via `test_set_capture_enabled`.
#[inline]
pub(crate) fn emit(trace: ConnectionTrace) {
    if !capture_enabled() {
        return;
    }
    if let Some(sink) = TELEMETRY_SINK.get() {
        sink.record(trace);
    }
}

/// Emit a finalized-turn record if a sink is installed.
#[inline]
pub(crate) fn emit_turn(log: TurnLog) {
    if !capture_enabled() {
        return;
    }
    if let Some(sink) = TELEMETRY_SINK.get() {
        sink.record_turn(log);
    }
}

#[cfg(test)]
/// Test-only helper: enable or disable capture for the current test thread.
///
/// Tasks spawned on a current-thread runtime inherit this; other threads must call it themselves.
pub fn test_set_capture_enabled(enabled: bool) {
    TEST_CAPTURE.with(|c| c.set(enabled));
}
