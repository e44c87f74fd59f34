pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod model;
pub mod normalizer;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod ws_client;
#[cfg(test)]
pub mod test_util;

pub use connection::{ConnectionManager, ConnectionState, FrameListener, Subscription};
pub use error::{ChatLinkError, CoreResult, SessionError};
pub use session::{ChatSession, SessionEvent, SessionPhase};
