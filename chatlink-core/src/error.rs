use thiserror::Error;

use crate::model::TurnId;

/// Core error type for chatlink.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum ChatLinkError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("connection to {endpoint} failed: {message}")]
    Connect { endpoint: String, message: String },

    #[error("connection manager was shut down")]
    ShutDown,

    #[error("connection to {endpoint} was replaced by a newer attempt")]
    Superseded { endpoint: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, ChatLinkError>;

/// Why a chat intent was rejected. Variants that carry `input` hand the text
/// back so the caller can restore it into the input box.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("message is empty")]
    EmptyInput,

    #[error("not connected")]
    NotConnected { input: String },

    #[error("a reply is still in progress")]
    Busy { input: String },

    #[error("failed to send message")]
    TransmitFailed { input: String },

    #[error("no turn with id {0}")]
    UnknownTurn(TurnId),

    #[error("turn {0} does not follow a user turn")]
    NoPrecedingUserTurn(TurnId),
}

impl SessionError {
    /// Input text to put back in front of the user, if any.
    pub fn into_input(self) -> Option<String> {
        match self {
            Self::NotConnected { input }
            | Self::Busy { input }
            | Self::TransmitFailed { input } => Some(input),
            _ => None,
        }
    }
}
