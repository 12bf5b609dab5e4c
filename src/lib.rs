//! # vigil-server
//!
//! Core of a home security appliance: keeps links to a camera peripheral
//! and a servo/sensor controller, runs every camera frame through a
//! processing pipeline, fans the live view out to remote viewers and
//! records the stream as fixed-duration segments.
//!
//! # Architecture
//!
//! ```text
//! vigil-server
//!   ├─> Device Links (camera + controller, heartbeat, supersession)
//!   ├─> Frame Processor (validate, normalize, enhance, score, stamp, re-encode)
//!   ├─> Frame Buffer (bounded history + latest slot)
//!   ├─> Quality Controller (adaptive compression / pacing)
//!   ├─> Recorder (segments, flush queue, retry, retention)
//!   └─> Broadcast Hub (per-viewer writers, eviction, events)
//! ```
//!
//! # Data Flow
//!
//! **Frame Path:** Camera → Device Link → Processor → Buffer → Hub → Viewers
//!
//! **Recording Path:** Processor → Recorder → Segment files + index
//!
//! **Command Path:** Viewer → Relay → Controller link

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Server configuration
pub mod config;

/// Fault classification shared by every subsystem
pub mod error;

/// Notable-event sink
pub mod events;

/// Frame type
pub mod frame;

/// Bounded frame history with a lock-free latest slot
pub mod buffer;

/// Frame timing and adaptive quality control
///
/// - **Performance Monitor**: sliding window of frame arrivals, latency,
///   jitter and drop rate.
///
/// - **Quality Controller**: moves the compression quality between a floor
///   and a ceiling from the monitor's snapshots, with a dead zone to avoid
///   oscillation, and publishes the pacing compensation factor.
pub mod performance;

/// Per-frame processing pipeline
pub mod processor;

/// Device links (camera and controller)
///
/// Each peripheral holds one websocket link. A link authenticates with a
/// token, is probed by an adaptive heartbeat and is superseded when the
/// same role reconnects.
pub mod link;

/// Per-role online status
pub mod status;

/// Credentials and viewer authorization
pub mod security;

/// Segment recording
///
/// Frames are grouped into segments bounded by duration and size. Ready
/// segments are encoded and written by a background flush queue with
/// retry; a retention task prunes old recordings.
pub mod recording;

/// Live-view fan-out to remote viewers
pub mod broadcast;

/// Main server implementation
pub mod server;

/// Utility functions
pub mod utils;
