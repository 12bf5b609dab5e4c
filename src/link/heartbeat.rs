//! Adaptive heartbeat
//!
//! Probe schedule for one link:
//!
//! ```text
//! inbound traffic within idle_probe_after  -> probe every streaming_probe_interval
//! silent for idle_probe_after             -> probe now
//! each unanswered probe                   -> next gap = initial * factor^(n-1), <= max_probe_interval
//! max_unanswered_probes unanswered        -> expire
//! silent for inactivity_timeout           -> expire
//! ```
//!
//! Any inbound message (pong or otherwise) resets the schedule. The logic
//! is pure; the session loop feeds it instants and acts on the result.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Heartbeat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Probe period while the peer is streaming (seconds)
    #[serde(default = "default_streaming_probe_interval")]
    pub streaming_probe_interval_secs: u64,

    /// Silence before probing starts (seconds)
    #[serde(default = "default_idle_probe_after")]
    pub idle_probe_after_secs: u64,

    /// Gap after the first unanswered probe (seconds)
    #[serde(default = "default_initial_probe_interval")]
    pub initial_probe_interval_secs: u64,

    /// Growth of the gap per unanswered probe
    #[serde(default = "default_escalation_factor")]
    pub escalation_factor: f64,

    /// Largest gap between probes (seconds)
    #[serde(default = "default_max_probe_interval")]
    pub max_probe_interval_secs: u64,

    /// Unanswered probes before the link is closed
    #[serde(default = "default_max_unanswered_probes")]
    pub max_unanswered_probes: u32,

    /// Total silence after which the link is closed (seconds)
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
}

fn default_streaming_probe_interval() -> u64 {
    60
}
fn default_idle_probe_after() -> u64 {
    10
}
fn default_initial_probe_interval() -> u64 {
    5
}
fn default_escalation_factor() -> f64 {
    2.0
}
fn default_max_probe_interval() -> u64 {
    30
}
fn default_max_unanswered_probes() -> u32 {
    4
}
fn default_inactivity_timeout() -> u64 {
    120
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            streaming_probe_interval_secs: default_streaming_probe_interval(),
            idle_probe_after_secs: default_idle_probe_after(),
            initial_probe_interval_secs: default_initial_probe_interval(),
            escalation_factor: default_escalation_factor(),
            max_probe_interval_secs: default_max_probe_interval(),
            max_unanswered_probes: default_max_unanswered_probes(),
            inactivity_timeout_secs: default_inactivity_timeout(),
        }
    }
}

impl HeartbeatConfig {
    fn streaming_interval(&self) -> Duration {
        Duration::from_secs(self.streaming_probe_interval_secs.max(1))
    }

    fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_probe_after_secs)
    }

    /// Inactivity window
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs.max(1))
    }

    /// Gap that follows the `unanswered`-th unanswered probe
    pub fn probe_gap(&self, unanswered: u32) -> Duration {
        let exponent = unanswered.saturating_sub(1).min(16) as i32;
        let secs = self.initial_probe_interval_secs as f64 * self.escalation_factor.max(1.0).powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_probe_interval_secs as f64).max(0.1))
    }
}

/// What the link owner should do now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Nothing to do before `until`
    Wait {
        /// Next instant worth polling again
        until: Instant,
    },
    /// Send a liveness probe
    Probe,
    /// Give up on the peer
    Expire,
}

/// Heartbeat state for one link
#[derive(Debug)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    started_at: Instant,
    last_inbound: Instant,
    last_probe: Option<Instant>,
    unanswered: u32,
}

impl Heartbeat {
    /// Start the schedule as if traffic was just seen
    pub fn new(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            started_at: now,
            last_inbound: now,
            last_probe: None,
            unanswered: 0,
        }
    }

    /// Unanswered probes since the last inbound message
    pub fn unanswered(&self) -> u32 {
        self.unanswered
    }

    /// Any inbound message resets the schedule
    pub fn on_inbound(&mut self, now: Instant) {
        self.last_inbound = now;
        self.unanswered = 0;
    }

    /// Record that a probe went out
    pub fn on_probe_sent(&mut self, now: Instant) {
        self.last_probe = Some(now);
        self.unanswered = self.unanswered.saturating_add(1);
    }

    /// Decide what to do at `now`
    pub fn poll(&self, now: Instant) -> HeartbeatAction {
        let expires_at = self.last_inbound + self.config.inactivity_timeout();
        if now >= expires_at {
            return HeartbeatAction::Expire;
        }

        let silence = now.saturating_duration_since(self.last_inbound);
        let probe_due = if self.unanswered == 0 {
            let idle_due = self.last_inbound + self.config.idle_after();
            let streaming_due =
                self.last_probe.unwrap_or(self.started_at) + self.config.streaming_interval();
            if silence < self.config.idle_after() {
                idle_due.min(streaming_due)
            } else {
                idle_due
            }
        } else {
            let gap_end = self
                .last_probe
                .map(|at| at + self.config.probe_gap(self.unanswered))
                .unwrap_or(now);
            if self.unanswered >= self.config.max_unanswered_probes {
                if now >= gap_end {
                    return HeartbeatAction::Expire;
                }
                return HeartbeatAction::Wait {
                    until: gap_end.min(expires_at),
                };
            }
            gap_end
        };

        if now >= probe_due {
            HeartbeatAction::Probe
        } else {
            HeartbeatAction::Wait {
                until: probe_due.min(expires_at),
            }
        }
    }
}
