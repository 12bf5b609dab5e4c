//! Lighting-aware image enhancement
//!
//! Classifies a frame by its luma histogram and applies a tone curve plus
//! optional sharpening suited to the lighting:
//!
//! | Mode | Chosen when | Tone curve | Sharpen |
//! |------|-------------|------------|---------|
//! | Night | mean < `night_threshold`, dark pixels > 2x bright | stretch, +`night_brightness_boost`, gamma `night_gamma`, x(1 + `night_contrast_boost`) | no |
//! | LowLight | mean < `night_threshold` otherwise | stretch, +`brightness_boost` | yes |
//! | Day | mean > `day_threshold` | stretch, x(1 + `contrast_enhancement`) | yes |
//! | Security | anything else | stretch, x1.1 + 5 | yes |
//!
//! "Stretch" maps the 1st..99th luma percentile onto the full range and is
//! skipped for nearly flat frames. Dark pixels have luma below 50, bright
//! pixels 200 and above.

use image::imageops;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;

const DARK_LUMA: usize = 50;
const BRIGHT_LUMA: usize = 200;
const MIN_STRETCH_RANGE: usize = 8;
const SECURITY_GAIN: f64 = 1.1;
const SECURITY_OFFSET: f64 = 5.0;

/// Enhancement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementMode {
    /// Pick a mode per frame from its lighting
    #[default]
    Auto,
    /// Bright scene
    Day,
    /// Dim scene with some highlights
    LowLight,
    /// Dark scene
    Night,
    /// Mid-range lighting
    Security,
}

impl fmt::Display for EnhancementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Day => "day",
            Self::LowLight => "low_light",
            Self::Night => "night",
            Self::Security => "security",
        };
        f.write_str(s)
    }
}

/// Enhancement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancementConfig {
    /// Run the enhancement stage
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Fixed mode, or `auto` to detect per frame
    #[serde(default)]
    pub mode: EnhancementMode,

    /// Mean luma below which a frame is night or low light
    #[serde(default = "default_night_threshold")]
    pub night_threshold: f64,

    /// Mean luma above which a frame is daylight
    #[serde(default = "default_day_threshold")]
    pub day_threshold: f64,

    /// Low-light brightness lift (fraction of full scale)
    #[serde(default = "default_brightness_boost")]
    pub brightness_boost: f64,

    /// Night brightness lift (fraction of full scale)
    #[serde(default = "default_night_brightness_boost")]
    pub night_brightness_boost: f64,

    /// Night gamma (< 1.0 lifts shadows)
    #[serde(default = "default_night_gamma")]
    pub night_gamma: f64,

    /// Extra night gain
    #[serde(default = "default_night_contrast_boost")]
    pub night_contrast_boost: f64,

    /// Extra daylight gain
    #[serde(default = "default_contrast_enhancement")]
    pub contrast_enhancement: f64,

    /// Unsharp-mask blur radius; 0 disables sharpening
    #[serde(default = "default_sharpen_sigma")]
    pub sharpen_sigma: f32,
}

fn default_enabled() -> bool {
    true
}
fn default_night_threshold() -> f64 {
    80.0
}
fn default_day_threshold() -> f64 {
    150.0
}
fn default_brightness_boost() -> f64 {
    0.2
}
fn default_night_brightness_boost() -> f64 {
    0.4
}
fn default_night_gamma() -> f64 {
    0.8
}
fn default_night_contrast_boost() -> f64 {
    0.5
}
fn default_contrast_enhancement() -> f64 {
    0.3
}
fn default_sharpen_sigma() -> f32 {
    1.0
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            mode: EnhancementMode::default(),
            night_threshold: default_night_threshold(),
            day_threshold: default_day_threshold(),
            brightness_boost: default_brightness_boost(),
            night_brightness_boost: default_night_brightness_boost(),
            night_gamma: default_night_gamma(),
            night_contrast_boost: default_night_contrast_boost(),
            contrast_enhancement: default_contrast_enhancement(),
            sharpen_sigma: default_sharpen_sigma(),
        }
    }
}

impl EnhancementConfig {
    /// Check thresholds and gains
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=255.0).contains(&self.night_threshold) || !(0.0..=255.0).contains(&self.day_threshold) {
            return Err("enhancement thresholds must lie in 0..=255".to_string());
        }
        if self.night_threshold > self.day_threshold {
            return Err(format!(
                "enhancement night_threshold ({}) exceeds day_threshold ({})",
                self.night_threshold, self.day_threshold
            ));
        }
        if self.night_gamma <= 0.0 {
            return Err("enhancement night_gamma must be positive".to_string());
        }
        if self.sharpen_sigma < 0.0 {
            return Err("enhancement sharpen_sigma must not be negative".to_string());
        }
        Ok(())
    }
}

/// Luma histogram summary
#[derive(Debug, Clone)]
pub struct Lighting {
    histogram: [u64; 256],
    pixels: u64,
    /// Mean luma
    pub mean: f64,
}

impl Lighting {
    /// Measure `image`
    pub fn measure(image: &RgbImage) -> Self {
        let gray = imageops::grayscale(image);
        let mut histogram = [0u64; 256];
        for &p in gray.as_raw() {
            histogram[p as usize] += 1;
        }
        let pixels: u64 = histogram.iter().sum();
        let total: u64 = histogram.iter().enumerate().map(|(v, &n)| v as u64 * n).sum();
        let mean = if pixels == 0 { 0.0 } else { total as f64 / pixels as f64 };
        Self {
            histogram,
            pixels,
            mean,
        }
    }

    /// Pixels with luma below 50
    pub fn dark_pixels(&self) -> u64 {
        self.histogram[..DARK_LUMA].iter().sum()
    }

    /// Pixels with luma of 200 and above
    pub fn bright_pixels(&self) -> u64 {
        self.histogram[BRIGHT_LUMA..].iter().sum()
    }

    fn percentile(&self, share: f64) -> usize {
        let wanted = (self.pixels as f64 * share).ceil() as u64;
        let mut seen = 0;
        for (value, &count) in self.histogram.iter().enumerate() {
            seen += count;
            if seen >= wanted.max(1) {
                return value;
            }
        }
        255
    }

    /// Stretch bounds, `None` for nearly flat frames
    fn stretch_range(&self) -> Option<(usize, usize)> {
        if self.pixels == 0 {
            return None;
        }
        let low = self.percentile(0.01);
        let high = self.percentile(0.99);
        (high >= low + MIN_STRETCH_RANGE).then_some((low, high))
    }
}

/// Pick a concrete mode from the frame's lighting
pub fn detect(lighting: &Lighting, config: &EnhancementConfig) -> EnhancementMode {
    if lighting.mean < config.night_threshold {
        if lighting.dark_pixels() > lighting.bright_pixels() * 2 {
            EnhancementMode::Night
        } else {
            EnhancementMode::LowLight
        }
    } else if lighting.mean > config.day_threshold {
        EnhancementMode::Day
    } else {
        EnhancementMode::Security
    }
}

fn tone_curve(mode: EnhancementMode, lighting: &Lighting, config: &EnhancementConfig) -> [u8; 256] {
    let stretch = lighting.stretch_range();
    let mut lut = [0u8; 256];
    for (value, out) in lut.iter_mut().enumerate() {
        let mut v = match stretch {
            Some((low, high)) => {
                (value.clamp(low, high) - low) as f64 * 255.0 / (high - low) as f64
            }
            None => value as f64,
        };
        match mode {
            EnhancementMode::Night => {
                v = (v + 255.0 * config.night_brightness_boost).min(255.0);
                v = 255.0 * (v / 255.0).powf(config.night_gamma);
                v *= 1.0 + config.night_contrast_boost;
            }
            EnhancementMode::LowLight => {
                v += 255.0 * config.brightness_boost;
            }
            EnhancementMode::Day => {
                v *= 1.0 + config.contrast_enhancement;
            }
            EnhancementMode::Security | EnhancementMode::Auto => {
                v = v * SECURITY_GAIN + SECURITY_OFFSET;
            }
        }
        *out = v.round().clamp(0.0, 255.0) as u8;
    }
    lut
}

/// Enhance `image` in the configured mode
///
/// Returns the enhanced image and the concrete mode applied.
pub fn enhance(image: &RgbImage, config: &EnhancementConfig) -> (RgbImage, EnhancementMode) {
    let lighting = Lighting::measure(image);
    let mode = match config.mode {
        EnhancementMode::Auto => detect(&lighting, config),
        fixed => fixed,
    };

    let lut = tone_curve(mode, &lighting, config);
    let mut out = image.clone();
    for channel in out.iter_mut() {
        *channel = lut[*channel as usize];
    }

    if mode != EnhancementMode::Night && config.sharpen_sigma > 0.0 {
        out = imageops::unsharpen(&out, config.sharpen_sigma, 2);
    }
    (out, mode)
}
