//! Image decode / resize / JPEG encode helpers
//!
//! Blocking functions, called from `spawn_blocking` by the processor.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageReader, RgbImage};
use std::io::Cursor;

use super::ProcessingError;

/// Read dimensions from the header without decoding pixels
pub fn probe_dimensions(bytes: &[u8]) -> Result<(u32, u32), ProcessingError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ProcessingError::Decode(e.to_string()))?
        .into_dimensions()
        .map_err(|e| ProcessingError::Decode(e.to_string()))
}

/// Decode to RGB, refusing images whose header exceeds `max_dimension`
pub fn decode(bytes: &[u8], max_dimension: u32) -> Result<RgbImage, ProcessingError> {
    let (w, h) = probe_dimensions(bytes)?;
    if w == 0 || h == 0 || w > max_dimension || h > max_dimension {
        return Err(ProcessingError::Dimensions(w, h));
    }
    let image = image::load_from_memory(bytes).map_err(|e| ProcessingError::Decode(e.to_string()))?;
    Ok(image.to_rgb8())
}

/// Resize only when the dimensions differ
pub fn resize_to(image: RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image;
    }
    image::imageops::resize(&image, width, height, FilterType::Triangle)
}

/// Encode as baseline JPEG at `quality` (1..=100)
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ProcessingError> {
    let mut out = Vec::with_capacity(image.as_raw().len() / 8);
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder
        .encode(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)
        .map_err(|e| ProcessingError::Encode(e.to_string()))?;
    Ok(out)
}

/// Quality for the second, size-driven encode pass
///
/// Scales the current quality by `target / actual`, never below `floor`
/// and always at least one step below `current` so the pass can shrink.
pub fn compression_quality(current: u8, actual_len: usize, target_len: usize, floor: u8) -> u8 {
    if actual_len == 0 {
        return current;
    }
    let ratio = target_len as f64 / actual_len as f64;
    let scaled = (current as f64 * ratio).round() as i64;
    let below_current = (current as i64 - 1).max(1);
    scaled.min(below_current).max(floor as i64).clamp(1, 100) as u8
}
