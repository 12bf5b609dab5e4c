//! Timestamp burn-in
//!
//! Draws `YYYY-MM-DD HH:MM:SS` in the top-left corner of a frame using a
//! built-in 5x7 glyph set, white on a black plate. Glyphs are scaled with
//! the frame width so the stamp stays legible after downscaling.

use chrono::{DateTime, Utc};
use image::{Rgb, RgbImage};

const GLYPH_W: u32 = 5;
const GLYPH_H: u32 = 7;
const MARGIN: u32 = 4;

/// Frame width covered by one glyph scale step
const WIDTH_PER_SCALE: u32 = 320;

const FOREGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);

/// Row bitmaps, most significant of the low five bits is the left column
fn glyph(c: char) -> [u8; 7] {
    match c {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        _ => [0; 7],
    }
}

/// Text stamped for a capture time
pub fn timestamp_text(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn scale_for(width: u32) -> u32 {
    (width / WIDTH_PER_SCALE).max(1)
}

/// Burn `text` into the top-left corner; clipped to the frame
pub fn draw_text(image: &mut RgbImage, text: &str) {
    let (width, height) = image.dimensions();
    let scale = scale_for(width);
    let advance = (GLYPH_W + 1) * scale;
    let plate_w = advance * text.chars().count() as u32 + 2 * scale;
    let plate_h = (GLYPH_H + 2) * scale;

    for y in MARGIN..(MARGIN + plate_h).min(height) {
        for x in MARGIN..(MARGIN + plate_w).min(width) {
            image.put_pixel(x, y, BACKGROUND);
        }
    }

    let origin_x = MARGIN + scale;
    let origin_y = MARGIN + scale;
    for (i, c) in text.chars().enumerate() {
        let rows = glyph(c);
        let gx = origin_x + i as u32 * advance;
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_W {
                if bits & (1 << (GLYPH_W - 1 - col)) == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        let px = gx + col * scale + dx;
                        let py = origin_y + row as u32 * scale + dy;
                        if px < width && py < height {
                            image.put_pixel(px, py, FOREGROUND);
                        }
                    }
                }
            }
        }
    }
}

/// Stamp the capture time onto a frame
pub fn stamp(image: &mut RgbImage, at: DateTime<Utc>) {
    draw_text(image, &timestamp_text(at));
}
