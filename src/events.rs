//! Event sink
//!
//! The core reports notable happenings (device logs, processing timeouts,
//! segment publication, authentication rejections) through [`EventSink`].
//! The account/settings side of the appliance owns the persistent event
//! log; this crate ships a bounded in-memory [`EventLog`] that also mirrors
//! every event to `tracing`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use tracing::{error, info, warn};

/// Subsystem an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Camera peripheral
    Camera,
    /// Servo/sensor controller peripheral
    Controller,
    /// Frame processing pipeline
    Processing,
    /// Segment recording and storage
    Recording,
    /// Viewer fan-out
    Broadcast,
    /// Authentication and authorization
    Security,
    /// Process lifecycle
    System,
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Camera => "camera",
            Self::Controller => "controller",
            Self::Processing => "processing",
            Self::Recording => "recording",
            Self::Broadcast => "broadcast",
            Self::Security => "security",
            Self::System => "system",
        };
        f.write_str(name)
    }
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Routine
    Info,
    /// Degraded but working
    Warning,
    /// Something failed
    Error,
}

impl Severity {
    /// Map a device-reported log level ("debug", "warn", "error", ...)
    pub fn from_level(level: &str) -> Self {
        match level.to_ascii_lowercase().as_str() {
            "warn" | "warning" => Self::Warning,
            "error" | "critical" | "fatal" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// Consumer of core events
pub trait EventSink: Send + Sync {
    /// Record one event
    fn emit_event(&self, message: &str, category: EventCategory, severity: Severity);
}

/// One recorded event
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    /// When the event was emitted
    pub at: DateTime<Utc>,
    /// Human-readable text
    pub message: String,
    /// Originating subsystem
    pub category: EventCategory,
    /// Severity
    pub severity: Severity,
}

/// Bounded in-memory event log
pub struct EventLog {
    capacity: usize,
    entries: Mutex<VecDeque<EventRecord>>,
}

impl EventLog {
    /// Keep at most `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Up to `n` most recent events, oldest first
    pub fn recent(&self, n: usize) -> Vec<EventRecord> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Number of events held
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for EventLog {
    fn emit_event(&self, message: &str, category: EventCategory, severity: Severity) {
        match severity {
            Severity::Info => info!("[{}] {}", category, message),
            Severity::Warning => warn!("[{}] {}", category, message),
            Severity::Error => error!("[{}] {}", category, message),
        }

        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(EventRecord {
            at: Utc::now(),
            message: message.to_string(),
            category,
            severity,
        });
    }
}
