//! Control plane messages
//!
//! Text websocket messages are JSON objects tagged by `"type"`. Binary
//! messages carry raw encoded frames with no envelope.
//!
//! | Type | Direction | Fields |
//! |------|-----------|--------|
//! | `authenticate` | peer → server | `token` |
//! | `auth_result` | server → peer | `status`, `reason` |
//! | `connection_ack` | server → peer | `status`, `message` |
//! | `ping` / `pong` | both | `timestamp` (opaque) |
//! | `servo` / `action` | viewer → server → controller | `command` |
//! | `log` | device → server | `message`, `level` |
//! | `status` | any | `data` (optional) |
//! | `photo_error` / `system_error` | camera → server | `message` |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const KNOWN_TYPES: &[&str] = &[
    "authenticate",
    "auth_result",
    "connection_ack",
    "ping",
    "pong",
    "servo",
    "action",
    "log",
    "status",
    "photo_error",
    "system_error",
];

/// Control plane parse failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not JSON, not an object, missing or mistyped fields
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Well-formed envelope with a type nobody handles
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// Message larger than the configured limit
    #[error("message too large: {0} bytes")]
    TooLarge(usize),
}

/// One control message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Credential presentation, first message on every link
    Authenticate {
        /// Role token (devices) or viewer token
        token: String,
    },

    /// Handshake outcome, sent before closing a rejected link
    AuthResult {
        /// "accepted" or "rejected"
        status: String,
        /// Why the credential was refused
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Sent after a successful handshake
    ConnectionAck {
        /// Always "connected"
        status: String,
        /// Human-readable greeting
        message: String,
    },

    /// Liveness probe
    Ping {
        /// Opaque value echoed in the pong
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
    },

    /// Probe response
    Pong {
        /// Echo of the probe's timestamp
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
    },

    /// Servo movement command
    Servo {
        /// Opaque command body understood by the controller firmware
        command: Value,
    },

    /// Discrete action (flash, buzzer, capture)
    Action {
        /// Opaque command body
        command: Value,
    },

    /// Log line from a peripheral
    Log {
        /// Log text
        message: String,
        /// Peripheral log level
        #[serde(default = "default_log_level")]
        level: String,
    },

    /// Status request (viewers) or sensor report (controller)
    Status {
        /// Report body, absent on requests
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    /// Camera failed to capture a frame
    PhotoError {
        /// Firmware error text
        message: String,
    },

    /// Peripheral-level fault
    SystemError {
        /// Firmware error text
        message: String,
    },
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ControlMessage {
    /// Parse a text frame, enforcing `max_len` bytes
    pub fn parse(text: &str, max_len: usize) -> Result<Self, ProtocolError> {
        if text.len() > max_len {
            return Err(ProtocolError::TooLarge(text.len()));
        }

        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing \"type\" field".to_string()))?;

        if !KNOWN_TYPES.contains(&kind) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Message type tag
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::AuthResult { .. } => "auth_result",
            Self::ConnectionAck { .. } => "connection_ack",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Servo { .. } => "servo",
            Self::Action { .. } => "action",
            Self::Log { .. } => "log",
            Self::Status { .. } => "status",
            Self::PhotoError { .. } => "photo_error",
            Self::SystemError { .. } => "system_error",
        }
    }

    /// JSON text for the wire
    pub fn to_json(&self) -> String {
        // A tagged enum of strings and JSON values always serializes.
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"type\":\"{}\"}}", self.kind()))
    }

    /// Handshake rejection notice
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::AuthResult {
            status: "rejected".to_string(),
            reason: Some(reason.into()),
        }
    }

    /// Handshake acknowledgement
    pub fn ack(message: impl Into<String>) -> Self {
        Self::ConnectionAck {
            status: "connected".to_string(),
            message: message.into(),
        }
    }
}
