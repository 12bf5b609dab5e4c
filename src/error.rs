//! Fault classification
//!
//! Every error raised inside the core falls into one of five classes. The
//! class decides what happens next:
//!
//! | Class | Handling |
//! |-------|----------|
//! | Transport | tear the link down, wait for the peer to reconnect |
//! | Protocol | log, drop the message, keep the link |
//! | Data | count, substitute or skip the frame |
//! | Resource | evict or back off; storage failures are retried later |
//! | Authentication | terminal for that connection attempt |
//!
//! None of them stops the process.

use std::fmt;

/// Class of a core error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Connection reset, timeout
    Transport,
    /// Malformed envelope, unknown message type
    Protocol,
    /// Oversized or corrupt frame
    Data,
    /// Buffer full, storage write failure
    Resource,
    /// Bad or missing credential
    Authentication,
}

impl FaultClass {
    /// Whether repeating the failed operation can help
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Transport | Self::Resource)
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Data => "data",
            Self::Resource => "resource",
            Self::Authentication => "authentication",
        };
        f.write_str(name)
    }
}
