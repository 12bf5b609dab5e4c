//! Shared pipeline tuning knobs
//!
//! Written by the quality controller tick, read by the frame processor
//! (encode quality) and the broadcast pacing loop (compensation factor).
//! Plain atomics: readers never wait on the controller.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use super::quality::QualityDecision;

const COMPENSATION_SCALE: f64 = 1000.0;

/// Current encode quality and pacing compensation
#[derive(Debug)]
pub struct PipelineTuning {
    quality: AtomicU8,
    compensation_milli: AtomicU32,
}

impl PipelineTuning {
    /// Start at `quality` with no pacing compensation
    pub fn new(quality: u8) -> Self {
        Self {
            quality: AtomicU8::new(quality),
            compensation_milli: AtomicU32::new(COMPENSATION_SCALE as u32),
        }
    }

    /// Encode quality for the next frame
    pub fn quality(&self) -> u8 {
        self.quality.load(Ordering::Relaxed)
    }

    /// Pacing compensation factor (>= 1.0)
    pub fn compensation(&self) -> f64 {
        self.compensation_milli.load(Ordering::Relaxed) as f64 / COMPENSATION_SCALE
    }

    /// Publish a controller decision
    pub fn apply(&self, decision: &QualityDecision) {
        self.quality.store(decision.quality, Ordering::Relaxed);
        let milli = (decision.compensation.max(1.0) * COMPENSATION_SCALE).round() as u32;
        self.compensation_milli.store(milli, Ordering::Relaxed);
    }
}
