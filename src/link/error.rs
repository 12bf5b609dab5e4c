//! Device link errors

use std::time::Duration;
use thiserror::Error;

use super::protocol::ProtocolError;
use super::state::LinkState;
use crate::error::FaultClass;
use crate::utils::Retryable;

/// Errors raised by device and viewer links
#[derive(Error, Debug)]
pub enum LinkError {
    /// State machine refused a transition
    #[error("invalid link transition {from} -> {to}")]
    InvalidTransition {
        /// State before
        from: LinkState,
        /// Requested state
        to: LinkState,
    },

    /// Websocket transport failed
    #[error("transport error: {0}")]
    Transport(String),

    /// A send did not complete in time
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    /// The link is already closed
    #[error("link closed")]
    Closed,

    /// Credential rejected
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// No credential before the handshake deadline
    #[error("authentication timed out")]
    AuthTimeout,

    /// Malformed or unexpected control message
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl LinkError {
    /// Fault class of this error
    pub fn class(&self) -> FaultClass {
        match self {
            Self::Transport(_) | Self::SendTimeout(_) | Self::Closed => FaultClass::Transport,
            Self::AuthRejected(_) | Self::AuthTimeout => FaultClass::Authentication,
            Self::Protocol(_) | Self::InvalidTransition { .. } => FaultClass::Protocol,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for LinkError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        match e {
            tokio_tungstenite::tungstenite::Error::ConnectionClosed
            | tokio_tungstenite::tungstenite::Error::AlreadyClosed => Self::Closed,
            other => Self::Transport(other.to_string()),
        }
    }
}

impl Retryable for LinkError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::SendTimeout(_))
    }
}
