//! Configuration type definitions
//!
//! Sections owned by a single subsystem live next to that subsystem
//! (`LinkConfig`, `FrameBufferConfig`, `RecordingConfig`, ...); the ones
//! here are consumed by the server and `main` only.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "0.0.0.0:8765")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Time allowed for tasks to finish after shutdown starts (seconds)
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Events kept in memory for the web side
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8765".to_string()
}
fn default_drain_timeout_secs() -> u64 {
    10
}
fn default_event_log_capacity() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            drain_timeout_secs: default_drain_timeout_secs(),
            event_log_capacity: default_event_log_capacity(),
        }
    }
}

impl ServerConfig {
    /// Shutdown drain deadline
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Pre-shared device role tokens
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Tokens accepted on `/ws/camera`
    #[serde(default)]
    pub camera_tokens: Vec<String>,

    /// Tokens accepted on `/ws/controller`
    #[serde(default)]
    pub controller_tokens: Vec<String>,
}

/// One viewer token and the principal it resolves to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerToken {
    /// Token presented in `authenticate`
    pub token: String,

    /// Account name logged for the viewer
    pub principal: String,
}

/// Viewer access configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewerConfig {
    /// Accepted viewer tokens
    #[serde(default)]
    pub tokens: Vec<ViewerToken>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level used when neither `RUST_LOG` nor `-v` is given
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily rolling log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: None,
        }
    }
}
