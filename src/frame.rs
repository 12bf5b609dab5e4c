//! Frame type shared by every pipeline stage
//!
//! A [`Frame`] is produced once by the
//! [`FrameProcessor`](crate::processor::FrameProcessor) and never mutated
//! afterwards. Stages share it as `Arc<Frame>`: the buffer's latest slot,
//! the active recording segment and the broadcast hub can each hold an
//! independent reference to the same payload.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Quality score reported when no image could be decoded
pub const DEFAULT_QUALITY_SCORE: f32 = 50.0;

/// How the processor arrived at a frame's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    /// Fully decoded, normalized and re-encoded
    Processed,
    /// Raw or partially processed bytes passed through after a failure
    PassThrough,
}

/// One encoded camera image
#[derive(Debug, Clone)]
pub struct Frame {
    /// Encoded image bytes (JPEG in practice)
    pub payload: Bytes,

    /// When the frame reached the server
    pub captured_at: DateTime<Utc>,

    /// Monotonic sequence assigned at ingestion
    pub sequence: u64,

    /// Heuristic image quality in 0..=100
    pub quality_score: f32,

    /// Time spent in the processing pipeline
    pub processing_latency: Duration,

    /// Pixel dimensions when the payload was decoded
    pub dimensions: Option<(u32, u32)>,

    /// Whether the payload went through the full pipeline
    pub origin: FrameOrigin,
}

impl Frame {
    /// Frame carrying bytes that were not (or not fully) processed
    pub fn pass_through(payload: Bytes, captured_at: DateTime<Utc>, sequence: u64) -> Self {
        Self {
            payload,
            captured_at,
            sequence,
            quality_score: DEFAULT_QUALITY_SCORE,
            processing_latency: Duration::ZERO,
            dimensions: None,
            origin: FrameOrigin::PassThrough,
        }
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True when the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// True when the frame went through every pipeline stage
    pub fn is_processed(&self) -> bool {
        self.origin == FrameOrigin::Processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_through_defaults() {
        let frame = Frame::pass_through(Bytes::from_static(b"abc"), Utc::now(), 7);
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.sequence, 7);
        assert_eq!(frame.quality_score, DEFAULT_QUALITY_SCORE);
        assert!(!frame.is_processed());
        assert!(frame.dimensions.is_none());
    }
}
