//! Security recording
//!
//! Processed frames are grouped into duration-bounded segments and written
//! to disk as `.vseg` containers.
//!
//! ```text
//! ingest ──submit()──> Recorder task ──> RecordingSession (sync core)
//!                         │                   │ FlushJob
//!                         │                   v
//!                         │      encode_segment (blocking pool)
//!                         │                   │
//!                         │    undersized? ───┴── yes ──> carry_forward (merge)
//!                         │                   │ no
//!                         │                   v
//!                         │   SegmentWriter (tmp + rename, retried)
//!                         │                   │
//!                         │                   v
//!                         └──────── SegmentCatalog::persist_segment
//! ```
//!
//! Storage failures that survive the retry policy park the segment on the
//! session's retry queue; it is tried again on the next flush cycle, so
//! buffered frames are never dropped because of a transient disk error.

mod container;
mod recorder;
mod segment;
mod session;
mod store;

pub use container::{decode_segment, encode_segment, ContainerError, DecodedSegment, EncodedSegment};
pub use recorder::{run_retention, Recorder, RecorderHandle};
pub use segment::{RecordingSegment, SegmentState};
pub use session::{FlushJob, FlushReason, HealthReport, RecordingSession, SegmentHealth, SegmentRecord};
pub use store::{
    sweep_retention, JsonIndexCatalog, SegmentCatalog, SegmentMetadata, SegmentWriter, StorageError, SweepReport,
};

#[cfg(test)]
pub use store::MockSegmentCatalog;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::RetryPolicy;

/// Recording configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Record camera frames at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Recordings root directory
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Frames a segment needs before it can be ready
    #[serde(default = "default_min_frames")]
    pub min_frames: usize,

    /// Duration a segment needs before it can be ready (seconds)
    #[serde(default = "default_min_duration_secs")]
    pub min_duration_secs: u64,

    /// Duration at which an eligible segment is flushed (seconds)
    #[serde(default = "default_target_duration_secs")]
    pub target_duration_secs: u64,

    /// Ceiling after which a segment stops collecting (seconds)
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,

    /// Written files below this size are merged forward (bytes)
    #[serde(default = "default_absolute_min_size")]
    pub absolute_min_size: usize,

    /// Carried frames older than this force a flush (seconds)
    #[serde(default = "default_straggler_max_age_secs")]
    pub straggler_max_age_secs: u64,

    /// Segments scored by the health pass
    #[serde(default = "default_health_window")]
    pub health_window: usize,

    /// Recorder queue depth (frames)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Flush/health cycle interval (milliseconds)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Days to keep segment files
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    /// Retention sweep interval (seconds)
    #[serde(default = "default_retention_interval_secs")]
    pub retention_interval_secs: u64,

    /// Segments held for a storage retry before the oldest is dropped
    #[serde(default = "default_retry_queue_limit")]
    pub retry_queue_limit: usize,

    /// Storage write retries
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_enabled() -> bool {
    true
}
fn default_directory() -> PathBuf {
    PathBuf::from("recordings")
}
fn default_min_frames() -> usize {
    600
}
fn default_min_duration_secs() -> u64 {
    60
}
fn default_target_duration_secs() -> u64 {
    600
}
fn default_max_duration_secs() -> u64 {
    1800
}
fn default_absolute_min_size() -> usize {
    500 * 1024
}
fn default_straggler_max_age_secs() -> u64 {
    3600
}
fn default_health_window() -> usize {
    50
}
fn default_queue_capacity() -> usize {
    256
}
fn default_retry_queue_limit() -> usize {
    32
}
fn default_tick_interval_ms() -> u64 {
    5000
}
fn default_retention_days() -> u64 {
    30
}
fn default_retention_interval_secs() -> u64 {
    3600
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            directory: default_directory(),
            min_frames: default_min_frames(),
            min_duration_secs: default_min_duration_secs(),
            target_duration_secs: default_target_duration_secs(),
            max_duration_secs: default_max_duration_secs(),
            absolute_min_size: default_absolute_min_size(),
            straggler_max_age_secs: default_straggler_max_age_secs(),
            health_window: default_health_window(),
            queue_capacity: default_queue_capacity(),
            tick_interval_ms: default_tick_interval_ms(),
            retention_days: default_retention_days(),
            retention_interval_secs: default_retention_interval_secs(),
            retry_queue_limit: default_retry_queue_limit(),
            retry: RetryPolicy::default(),
        }
    }
}

impl RecordingConfig {
    /// Minimum segment duration
    pub fn min_duration(&self) -> Duration {
        Duration::from_secs(self.min_duration_secs)
    }

    /// Target segment duration
    pub fn target_duration(&self) -> Duration {
        Duration::from_secs(self.target_duration_secs)
    }

    /// Segment duration ceiling
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    /// Age at which carried frames force a flush
    pub fn straggler_max_age(&self) -> Duration {
        Duration::from_secs(self.straggler_max_age_secs)
    }

    /// Flush cycle interval
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Retention window
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 3600)
    }

    /// Retention sweep interval
    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs.max(1))
    }

    /// Check duration and size bounds
    pub fn validate(&self) -> Result<(), String> {
        if self.min_frames == 0 {
            return Err("recording.min_frames must be at least 1".to_string());
        }
        if self.min_duration_secs > self.target_duration_secs {
            return Err(format!(
                "recording.min_duration_secs ({}) exceeds target_duration_secs ({})",
                self.min_duration_secs, self.target_duration_secs
            ));
        }
        if self.target_duration_secs > self.max_duration_secs {
            return Err(format!(
                "recording.target_duration_secs ({}) exceeds max_duration_secs ({})",
                self.target_duration_secs, self.max_duration_secs
            ));
        }
        if self.queue_capacity == 0 {
            return Err("recording.queue_capacity must be at least 1".to_string());
        }
        if self.retry_queue_limit == 0 {
            return Err("recording.retry_queue_limit must be at least 1".to_string());
        }
        Ok(())
    }
}
