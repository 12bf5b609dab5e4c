//! Recording segment
//!
//! ```text
//! Collecting ──(min frames AND min duration, then target)──> Ready ──> Flushing ──> Flushed
//!      │                                                                  │
//!      ├──(max ceiling below min frames)──> Merged                        └──(undersized)──> Merged
//!      └──(disconnect, shutdown, straggler)──────────────────> Flushing
//! ```
//!
//! A merged segment hands its frames to the next segment in capture order.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::frame::Frame;

/// Segment lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    /// Accepting frames
    Collecting,
    /// Eligible and complete, waiting for the writer
    Ready,
    /// Being encoded and written
    Flushing,
    /// Durably written and catalogued
    Flushed,
    /// Frames carried into the next segment
    Merged,
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Collecting => "collecting",
            Self::Ready => "ready",
            Self::Flushing => "flushing",
            Self::Flushed => "flushed",
            Self::Merged => "merged",
        };
        f.write_str(s)
    }
}

/// A run of consecutive frames bound for one file
#[derive(Debug, Clone)]
pub struct RecordingSegment {
    /// Monotonic segment number
    pub number: u64,
    /// Frames in capture order
    pub frames: Vec<Arc<Frame>>,
    /// Segment clock origin
    pub started_at: DateTime<Utc>,
    /// Sum of frame payload sizes
    pub byte_size: usize,
    /// Lifecycle state
    pub state: SegmentState,
    /// Numbers of segments whose frames were carried into this one
    pub merged_from: Vec<u64>,
}

impl RecordingSegment {
    /// Empty collecting segment
    pub fn new(number: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            number,
            frames: Vec::new(),
            started_at,
            byte_size: 0,
            state: SegmentState::Collecting,
            merged_from: Vec::new(),
        }
    }

    /// Number of frames held
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// True when no frame has been added
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Append one frame
    pub fn push(&mut self, frame: Arc<Frame>) {
        self.byte_size += frame.len();
        self.frames.push(frame);
    }

    /// Insert frames carried over from merged segments ahead of our own
    pub fn prepend(&mut self, carried: Vec<Arc<Frame>>, from: &[u64]) {
        self.byte_size += carried.iter().map(|f| f.len()).sum::<usize>();
        let mut frames = carried;
        frames.append(&mut self.frames);
        self.frames = frames;
        let mut merged = from.to_vec();
        merged.append(&mut self.merged_from);
        self.merged_from = merged;
    }

    /// Time on the segment clock at `now`
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Capture time of the oldest frame
    pub fn oldest_frame_at(&self) -> Option<DateTime<Utc>> {
        self.frames.first().map(|f| f.captured_at)
    }

    /// Capture time of the newest frame
    pub fn newest_frame_at(&self) -> Option<DateTime<Utc>> {
        self.frames.last().map(|f| f.captured_at)
    }
}
