//! Live view fan-out
//!
//! The hub hands the newest processed frame to every connected viewer
//! without ever waiting on one of them:
//!
//! ```text
//! pacing tick ──publish(latest)──> BroadcastHub
//!                                    │ snapshot viewer list, drop lock
//!                                    ├──> slot A: mailbox (cap 1) ──> writer A ──> ws
//!                                    ├──> slot B: still in flight, failure += 1
//!                                    └──> slot C: failures >= max, evicted
//! ```
//!
//! Each viewer owns a writer task. A mailbox holds at most one frame, so a
//! viewer that falls behind skips straight to the latest frame instead of
//! building a backlog. A viewer whose writer is still busy when the next
//! tick arrives, or whose sends keep failing, is evicted after
//! `max_consecutive_failures` strikes. Ingestion never blocks on viewers.

mod hub;
mod viewer;

pub use hub::{BroadcastHub, EvictReason, HubStats, ViewerConnection, ViewerTicket};
pub use viewer::{run_viewer_session, ViewerRequests, ViewerSessionContext, ViewerSink, WsViewerSink};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Broadcast failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// Viewer limit reached
    #[error("viewer limit reached ({0})")]
    TooManyViewers(usize),

    /// A send did not complete in time
    #[error("viewer send timed out after {0:?}")]
    SendTimeout(Duration),

    /// Transport refused the message
    #[error("viewer send failed: {0}")]
    Send(String),

    /// Viewer already gone
    #[error("viewer closed")]
    Closed,
}

/// Broadcast configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Concurrent viewer limit
    #[serde(default = "default_max_viewers")]
    pub max_viewers: usize,

    /// Nominal live view rate before compensation
    #[serde(default = "default_pacing_fps")]
    pub pacing_fps: f64,

    /// Per-send deadline (milliseconds)
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Strikes before a viewer is evicted
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Pending status events per viewer
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Close viewers silent for this long (seconds)
    #[serde(default = "default_viewer_inactivity_secs")]
    pub viewer_inactivity_secs: u64,

    /// Inbound messages allowed per viewer per minute
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
}

fn default_max_viewers() -> usize {
    100
}
fn default_pacing_fps() -> f64 {
    30.0
}
fn default_send_timeout_ms() -> u64 {
    2000
}
fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_event_capacity() -> usize {
    16
}
fn default_viewer_inactivity_secs() -> u64 {
    300
}
fn default_rate_limit_per_minute() -> u32 {
    100
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            max_viewers: default_max_viewers(),
            pacing_fps: default_pacing_fps(),
            send_timeout_ms: default_send_timeout_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            event_capacity: default_event_capacity(),
            viewer_inactivity_secs: default_viewer_inactivity_secs(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
        }
    }
}

impl BroadcastConfig {
    /// Per-send deadline
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Viewer inactivity limit
    pub fn viewer_inactivity(&self) -> Duration {
        Duration::from_secs(self.viewer_inactivity_secs)
    }

    /// Pacing interval inflated by the compensation factor
    pub fn pacing_interval(&self, compensation: f64) -> Duration {
        let fps = if self.pacing_fps.is_finite() && self.pacing_fps > 0.0 {
            self.pacing_fps
        } else {
            default_pacing_fps()
        };
        let factor = if compensation.is_finite() {
            compensation.max(1.0)
        } else {
            1.0
        };
        Duration::from_secs_f64(factor / fps)
    }

    /// Check limits
    pub fn validate(&self) -> Result<(), String> {
        if self.max_viewers == 0 {
            return Err("broadcast.max_viewers must be at least 1".to_string());
        }
        if !(self.pacing_fps.is_finite() && self.pacing_fps > 0.0) {
            return Err(format!("broadcast.pacing_fps must be positive, got {}", self.pacing_fps));
        }
        if self.max_consecutive_failures == 0 {
            return Err("broadcast.max_consecutive_failures must be at least 1".to_string());
        }
        Ok(())
    }
}
