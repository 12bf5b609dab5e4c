//! Frame quality scoring
//!
//! Scores a frame in `[0, 100]` from four luma measurements:
//!
//! | Metric | Measure | Normalisation | Weight |
//! |--------|---------|---------------|--------|
//! | Sharpness | variance of the 4-neighbour Laplacian | `var / 10` | 0.4 |
//! | Brightness | mean luma | `mean / 2.55` | 0.2 |
//! | Contrast | luma standard deviation | `std / 2.55` | 0.2 |
//! | Edges | share of pixels with Sobel magnitude above threshold | `density * 1000` | 0.2 |
//!
//! Each metric is capped at 100 before weighting.

use image::{GrayImage, RgbImage};

/// Gradient magnitude counted as an edge
const EDGE_THRESHOLD: f64 = 100.0;

const SHARPNESS_WEIGHT: f64 = 0.4;
const BRIGHTNESS_WEIGHT: f64 = 0.2;
const CONTRAST_WEIGHT: f64 = 0.2;
const EDGE_WEIGHT: f64 = 0.2;

/// Individual metric scores, each in `[0, 100]`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QualityBreakdown {
    /// Laplacian variance score
    pub sharpness: f64,
    /// Mean luma score
    pub brightness: f64,
    /// Luma spread score
    pub contrast: f64,
    /// Edge density score
    pub edges: f64,
}

impl QualityBreakdown {
    /// Weighted score
    pub fn score(&self) -> f32 {
        (self.sharpness * SHARPNESS_WEIGHT
            + self.brightness * BRIGHTNESS_WEIGHT
            + self.contrast * CONTRAST_WEIGHT
            + self.edges * EDGE_WEIGHT) as f32
    }
}

fn cap(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

/// Measure an RGB frame
pub fn analyze(image: &RgbImage) -> QualityBreakdown {
    let gray: GrayImage = image::imageops::grayscale(image);
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return QualityBreakdown::default();
    }

    let luma: Vec<f64> = gray.as_raw().iter().map(|&p| p as f64).collect();
    let n = luma.len() as f64;
    let mean = luma.iter().sum::<f64>() / n;
    let variance = luma.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    let at = |x: u32, y: u32| luma[(y * w + x) as usize];

    // Interior pixels only; frames narrower than 3px have no Laplacian.
    let mut laplacian = Vec::new();
    let mut edge_pixels = 0u64;
    if w >= 3 && h >= 3 {
        laplacian.reserve(((w - 2) * (h - 2)) as usize);
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let c = at(x, y);
                laplacian.push(at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * c);

                let gx = (at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1))
                    - (at(x - 1, y - 1) + 2.0 * at(x - 1, y) + at(x - 1, y + 1));
                let gy = (at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1))
                    - (at(x - 1, y - 1) + 2.0 * at(x, y - 1) + at(x + 1, y - 1));
                if (gx * gx + gy * gy).sqrt() > EDGE_THRESHOLD {
                    edge_pixels += 1;
                }
            }
        }
    }

    let laplacian_var = if laplacian.is_empty() {
        0.0
    } else {
        let m = laplacian.len() as f64;
        let lm = laplacian.iter().sum::<f64>() / m;
        laplacian.iter().map(|v| (v - lm).powi(2)).sum::<f64>() / m
    };

    QualityBreakdown {
        sharpness: cap(laplacian_var / 10.0),
        brightness: cap(mean / 2.55),
        contrast: cap(variance.sqrt() / 2.55),
        edges: cap(edge_pixels as f64 / n * 1000.0),
    }
}
