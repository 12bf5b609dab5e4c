//! Link state machine
//!
//! ```text
//! Connecting ──accept──> Authenticating ──valid token──> Active <──> Degraded
//!     │                        │                           │           │
//!     └────────────────────────┴───────────────────────────┴───────────┴──> Closed
//! ```
//!
//! `Active -> Degraded` happens once the error counter passes the
//! threshold; the next successful activity returns the link to `Active`
//! and clears the counter. `Closed` is terminal.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::LinkError;

/// Which peripheral a link belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    /// Camera unit streaming frames
    Camera,
    /// Servo/sensor controller
    Controller,
}

impl DeviceRole {
    /// Both roles, in a stable order
    pub const ALL: [DeviceRole; 2] = [DeviceRole::Camera, DeviceRole::Controller];

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::Controller => "controller",
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a device link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Transport not yet accepted
    Connecting,
    /// Waiting for the credential
    Authenticating,
    /// Authenticated and healthy
    Active,
    /// Authenticated, error counter over threshold
    Degraded,
    /// Terminal
    Closed,
}

impl LinkState {
    /// Whether `next` is a legal successor
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Authenticating, Active)
                | (Active, Degraded)
                | (Degraded, Active)
                | (Connecting | Authenticating | Active | Degraded, Closed)
        )
    }

    /// True for states in which the peripheral counts as online
    pub fn is_online(self) -> bool {
        matches!(self, LinkState::Active | LinkState::Degraded)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a link was closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the connection
    PeerClosed,
    /// Connection reset or other transport failure
    TransportError(String),
    /// A newer authenticated link of the same role took over
    Superseded,
    /// No inbound traffic within the inactivity window
    InactivityTimeout,
    /// Presented credential was not accepted
    AuthRejected(String),
    /// No credential within the handshake deadline
    AuthTimeout,
    /// Process shutdown
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::TransportError(e) => write!(f, "transport error: {}", e),
            Self::Superseded => write!(f, "superseded by newer connection"),
            Self::InactivityTimeout => write!(f, "inactivity timeout"),
            Self::AuthRejected(reason) => write!(f, "authentication rejected: {}", reason),
            Self::AuthTimeout => write!(f, "authentication timeout"),
            Self::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// State plus error counter
#[derive(Debug)]
pub struct LinkStateMachine {
    state: LinkState,
    error_count: u32,
    degrade_threshold: u32,
}

impl LinkStateMachine {
    /// Start in `Connecting`
    pub fn new(degrade_threshold: u32) -> Self {
        Self {
            state: LinkState::Connecting,
            error_count: 0,
            degrade_threshold: degrade_threshold.max(1),
        }
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Errors since the link last recovered
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&mut self, next: LinkState) -> Result<LinkState, LinkError> {
        if !self.state.can_transition_to(next) {
            return Err(LinkError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    /// Count an error; returns `Some(previous)` when this degraded the link
    pub fn record_error(&mut self) -> Option<LinkState> {
        self.error_count = self.error_count.saturating_add(1);
        if self.state == LinkState::Active && self.error_count > self.degrade_threshold {
            return self.transition(LinkState::Degraded).ok();
        }
        None
    }

    /// Note successful activity; returns `Some(previous)` when this recovered the link
    pub fn record_success(&mut self) -> Option<LinkState> {
        if self.state == LinkState::Degraded {
            self.error_count = 0;
            return self.transition(LinkState::Active).ok();
        }
        None
    }
}
