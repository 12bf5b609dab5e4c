//! `.vseg` segment container
//!
//! Little-endian, frames stored as-is (already JPEG encoded):
//!
//! ```text
//! +------+---------+-------+---------+----------+--------+-------------+
//! | VSEG | version | flags | segment | start_ms | end_ms | frame_count |
//! |  4   |   u16   |  u16  |   u64   |   i64    |  i64   |     u32     |
//! +------+---------+-------+---------+----------+--------+-------------+
//! | frame_count x { captured_ms: i64, offset: u64, length: u32 }       |
//! +--------------------------------------------------------------------+
//! | frame bytes, concatenated; offsets are relative to this region     |
//! +--------------------------------------------------------------------+
//! ```
//!
//! While encoding, a frame whose payload cannot be read as an image is
//! replaced with the previous readable frame (keeping its own timestamp).
//! Unreadable frames before the first readable one are dropped.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::frame::Frame;
use crate::processor::probe_dimensions;

/// File magic
pub const MAGIC: &[u8; 4] = b"VSEG";
/// Current format version
pub const VERSION: u16 = 1;

const HEADER_LEN: usize = 4 + 2 + 2 + 8 + 8 + 8 + 4;
const ENTRY_LEN: usize = 8 + 8 + 4;

/// Container encode/decode failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContainerError {
    #[error("not a segment file")]
    BadMagic,

    #[error("unsupported segment version {0}")]
    UnsupportedVersion(u16),

    #[error("segment data truncated")]
    Truncated,

    #[error("segment has no readable frames")]
    NoReadableFrames,

    #[error("segment has too many frames: {0}")]
    TooManyFrames(usize),
}

/// Encoded container plus what happened while building it
#[derive(Debug, Clone)]
pub struct EncodedSegment {
    /// Complete file contents
    pub bytes: Bytes,
    /// Frames written
    pub frame_count: u32,
    /// Unreadable frames replaced by the previous good one
    pub substituted: u32,
    /// Unreadable frames dropped before the first good one
    pub dropped: u32,
    /// First written frame
    pub started_at: DateTime<Utc>,
    /// Last written frame
    pub ended_at: DateTime<Utc>,
}

/// Decoded container
#[derive(Debug, Clone)]
pub struct DecodedSegment {
    /// Segment number from the header
    pub number: u64,
    /// Header start time (ms since epoch)
    pub start_ms: i64,
    /// Header end time (ms since epoch)
    pub end_ms: i64,
    /// `(captured_ms, payload)` in file order
    pub frames: Vec<(i64, Bytes)>,
}

fn readable(payload: &[u8]) -> bool {
    !payload.is_empty() && probe_dimensions(payload).is_ok()
}

/// Build a container for `frames`
pub fn encode_segment(number: u64, frames: &[Arc<Frame>]) -> Result<EncodedSegment, ContainerError> {
    let mut entries: Vec<(i64, Bytes)> = Vec::with_capacity(frames.len());
    let mut last_good: Option<Bytes> = None;
    let mut substituted = 0u32;
    let mut dropped = 0u32;

    for frame in frames {
        let at = frame.captured_at.timestamp_millis();
        if readable(&frame.payload) {
            last_good = Some(frame.payload.clone());
            entries.push((at, frame.payload.clone()));
        } else if let Some(good) = &last_good {
            substituted += 1;
            entries.push((at, good.clone()));
        } else {
            dropped += 1;
        }
    }

    let (first, last) = match (entries.first(), entries.last()) {
        (Some(f), Some(l)) => (f.0, l.0),
        _ => return Err(ContainerError::NoReadableFrames),
    };
    let count = u32::try_from(entries.len()).map_err(|_| ContainerError::TooManyFrames(entries.len()))?;

    let data_len: usize = entries.iter().map(|(_, b)| b.len()).sum();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + entries.len() * ENTRY_LEN + data_len);
    buf.put_slice(MAGIC);
    buf.put_u16_le(VERSION);
    buf.put_u16_le(0);
    buf.put_u64_le(number);
    buf.put_i64_le(first);
    buf.put_i64_le(last);
    buf.put_u32_le(count);

    let mut offset = 0u64;
    for (at, payload) in &entries {
        buf.put_i64_le(*at);
        buf.put_u64_le(offset);
        buf.put_u32_le(payload.len() as u32);
        offset += payload.len() as u64;
    }
    for (_, payload) in &entries {
        buf.put_slice(payload);
    }

    let to_utc = |ms: i64| DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default();
    Ok(EncodedSegment {
        bytes: buf.freeze(),
        frame_count: count,
        substituted,
        dropped,
        started_at: to_utc(first),
        ended_at: to_utc(last),
    })
}

/// Parse a container
pub fn decode_segment(mut bytes: Bytes) -> Result<DecodedSegment, ContainerError> {
    if bytes.len() < HEADER_LEN {
        return Err(ContainerError::Truncated);
    }
    if &bytes[..4] != MAGIC {
        return Err(ContainerError::BadMagic);
    }
    bytes.advance(4);
    let version = bytes.get_u16_le();
    if version != VERSION {
        return Err(ContainerError::UnsupportedVersion(version));
    }
    let _flags = bytes.get_u16_le();
    let number = bytes.get_u64_le();
    let start_ms = bytes.get_i64_le();
    let end_ms = bytes.get_i64_le();
    let count = bytes.get_u32_le() as usize;

    let table_len = count.checked_mul(ENTRY_LEN).ok_or(ContainerError::Truncated)?;
    if bytes.len() < table_len {
        return Err(ContainerError::Truncated);
    }
    let mut table = bytes.split_to(table_len);
    let data = bytes;

    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let at = table.get_i64_le();
        let offset = usize::try_from(table.get_u64_le()).map_err(|_| ContainerError::Truncated)?;
        let len = table.get_u32_le() as usize;
        let end = offset.checked_add(len).ok_or(ContainerError::Truncated)?;
        if end > data.len() {
            return Err(ContainerError::Truncated);
        }
        frames.push((at, data.slice(offset..end)));
    }

    Ok(DecodedSegment {
        number,
        start_ms,
        end_ms,
        frames,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn jpeg_frame(seq: u64, at: DateTime<Utc>, shade: u8) -> Arc<Frame> {
        let img = RgbImage::from_pixel(8, 8, Rgb([shade, shade, shade]));
        let mut out = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 80)
            .encode(img.as_raw(), 8, 8, image::ExtendedColorType::Rgb8)
            .unwrap();
        Arc::new(Frame::pass_through(Bytes::from(out), at, seq))
    }

    fn corrupt_frame(seq: u64, at: DateTime<Utc>) -> Arc<Frame> {
        Arc::new(Frame::pass_through(Bytes::from_static(b"garbage"), at, seq))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_encode_and_read_back() {
        let frames = vec![jpeg_frame(0, at(0), 10), jpeg_frame(1, at(1), 200)];
        let encoded = encode_segment(7, &frames).unwrap();
        assert_eq!(encoded.frame_count, 2);
        assert_eq!(encoded.substituted, 0);

        let decoded = decode_segment(encoded.bytes.clone()).unwrap();
        assert_eq!(decoded.number, 7);
        assert_eq!(decoded.start_ms, at(0).timestamp_millis());
        assert_eq!(decoded.end_ms, at(1).timestamp_millis());
        assert_eq!(decoded.frames[1].1, frames[1].payload);
    }

    #[test]
    fn test_corrupt_frame_replaced_by_previous_good() {
        let good = jpeg_frame(0, at(0), 90);
        let frames = vec![
            corrupt_frame(0, at(0)),
            Arc::clone(&good),
            corrupt_frame(2, at(2)),
            jpeg_frame(3, at(3), 30),
        ];
        let encoded = encode_segment(1, &frames).unwrap();
        assert_eq!(encoded.dropped, 1);
        assert_eq!(encoded.substituted, 1);
        assert_eq!(encoded.frame_count, 3);

        let decoded = decode_segment(encoded.bytes).unwrap();
        assert_eq!(decoded.frames[1].0, at(2).timestamp_millis());
        assert_eq!(decoded.frames[1].1, good.payload);
    }

    #[test]
    fn test_nothing_readable() {
        let frames = vec![corrupt_frame(0, at(0))];
        assert_eq!(
            encode_segment(1, &frames).unwrap_err(),
            ContainerError::NoReadableFrames
        );
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert_eq!(
            decode_segment(Bytes::from_static(b"VSEG")).unwrap_err(),
            ContainerError::Truncated
        );
        let mut bogus = vec![0u8; HEADER_LEN];
        bogus[..4].copy_from_slice(b"MP4X");
        assert_eq!(
            decode_segment(Bytes::from(bogus)).unwrap_err(),
            ContainerError::BadMagic
        );

        let frames = vec![jpeg_frame(0, at(0), 10)];
        let encoded = encode_segment(1, &frames).unwrap();
        let cut = encoded.bytes.slice(..encoded.bytes.len() - 1);
        assert_eq!(decode_segment(cut).unwrap_err(), ContainerError::Truncated);
    }
}
