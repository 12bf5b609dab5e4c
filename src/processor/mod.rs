//! Frame Processing Pipeline
//!
//! Turns one inbound camera payload into a [`Frame`]:
//!
//! ```text
//! payload ─> validate ─> decode ─> resize ─> enhance? ─> overlay ─> encode ─> compress? ─> Frame
//!               │           │         │                      │          │          │
//!               └───────────┴─────────┴──────────────────────┴──────────┴──────────┴─> pass-through
//! ```
//!
//! # Failure semantics
//!
//! [`FrameProcessor::process`] never fails. Every stage runs on the blocking
//! pool under its own deadline and the whole pipeline under a total budget.
//! When a stage fails or runs out of time the processor returns the best
//! output it already has:
//!
//! | Failed at | Output |
//! |-----------|--------|
//! | validate, decode, resize, overlay, encode | raw payload (pass-through) |
//! | enhance | unenhanced image continues down the pipeline |
//! | compress | first-pass encoded bytes |
//!
//! and bumps the matching [`ProcessingStats`] counter. Timeouts are also
//! reported to the event sink.
//!
//! # Quality
//!
//! The encode quality is read from [`PipelineTuning`] on every frame, so
//! decisions of the quality controller take effect on the next payload.

mod analysis;
mod codec;
mod enhance;
mod overlay;

pub use analysis::{analyze, QualityBreakdown};
pub use codec::{compression_quality, probe_dimensions};
pub use enhance::{detect as detect_lighting, enhance, EnhancementConfig, EnhancementMode, Lighting};
pub use overlay::{stamp, timestamp_text};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::RgbImage;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::events::{EventCategory, EventSink, Severity};
use crate::frame::{Frame, FrameOrigin, DEFAULT_QUALITY_SCORE};
use crate::performance::PipelineTuning;

/// Frame processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Run decode/resize/overlay/encode; when false valid payloads pass through
    #[serde(default = "default_true")]
    pub processing_enabled: bool,

    /// Largest accepted payload (bytes)
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Largest accepted width or height (pixels)
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,

    /// Output width (pixels)
    #[serde(default = "default_target_width")]
    pub target_width: u32,

    /// Output height (pixels)
    #[serde(default = "default_target_height")]
    pub target_height: u32,

    /// Burn the capture time into each frame
    #[serde(default = "default_true")]
    pub overlay_enabled: bool,

    /// Compute a quality score for each frame
    #[serde(default = "default_true")]
    pub scoring_enabled: bool,

    /// Encoded size that triggers a second compression pass (bytes)
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,

    /// Size the second pass aims for (bytes)
    #[serde(default = "default_compression_target")]
    pub compression_target: usize,

    /// Lowest quality the second pass may use
    #[serde(default = "default_min_compression_quality")]
    pub min_compression_quality: u8,

    /// Deadline per stage (milliseconds)
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,

    /// Deadline for the whole pipeline (milliseconds)
    #[serde(default = "default_pipeline_budget_ms")]
    pub pipeline_budget_ms: u64,

    /// Lighting-aware enhancement
    #[serde(default)]
    pub enhancement: EnhancementConfig,
}

fn default_true() -> bool {
    true
}
fn default_max_frame_size() -> usize {
    2 * 1024 * 1024
}
fn default_max_dimension() -> u32 {
    4096
}
fn default_target_width() -> u32 {
    640
}
fn default_target_height() -> u32 {
    480
}
fn default_compression_threshold() -> usize {
    1024 * 1024
}
fn default_compression_target() -> usize {
    512 * 1024
}
fn default_min_compression_quality() -> u8 {
    30
}
fn default_stage_timeout_ms() -> u64 {
    1000
}
fn default_pipeline_budget_ms() -> u64 {
    5000
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            processing_enabled: true,
            max_frame_size: default_max_frame_size(),
            max_dimension: default_max_dimension(),
            target_width: default_target_width(),
            target_height: default_target_height(),
            overlay_enabled: true,
            scoring_enabled: true,
            compression_threshold: default_compression_threshold(),
            compression_target: default_compression_target(),
            min_compression_quality: default_min_compression_quality(),
            stage_timeout_ms: default_stage_timeout_ms(),
            pipeline_budget_ms: default_pipeline_budget_ms(),
            enhancement: EnhancementConfig::default(),
        }
    }
}

impl ProcessorConfig {
    /// Per-stage deadline
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    /// Whole-pipeline deadline
    pub fn pipeline_budget(&self) -> Duration {
        Duration::from_millis(self.pipeline_budget_ms)
    }
}

/// Pipeline stage, for stats and timeout reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Header probe and pixel decode
    Decode,
    /// Scale to the target resolution
    Resize,
    /// Lighting-aware tone and sharpness
    Enhance,
    /// Timestamp burn-in
    Overlay,
    /// First JPEG encode (and scoring)
    Encode,
    /// Second, size-driven encode
    Compress,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Decode => "decode",
            Stage::Resize => "resize",
            Stage::Enhance => "enhance",
            Stage::Overlay => "overlay",
            Stage::Encode => "encode",
            Stage::Compress => "compress",
        };
        f.write_str(s)
    }
}

/// Processing errors
///
/// Internal to the pipeline; callers only ever see a [`Frame`].
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("empty payload")]
    Empty,

    #[error("payload of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("unsupported dimensions {0}x{1}")]
    Dimensions(u32, u32),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("{stage} exceeded its {budget:?} budget")]
    StageTimeout { stage: Stage, budget: Duration },

    #[error("worker failed: {0}")]
    Worker(String),
}

/// Frame processing statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingStats {
    /// Payloads handed to the processor
    pub frames_received: u64,

    /// Frames that went through the full pipeline
    pub frames_processed: u64,

    /// Frames returned unchanged (disabled, invalid, or failed)
    pub frames_passed_through: u64,

    /// Empty or oversized payloads
    pub invalid_frames: u64,

    /// Payloads that would not decode
    pub decode_failures: u64,

    /// Resize/overlay/encode failures
    pub stage_failures: u64,

    /// Stage or pipeline deadlines hit
    pub timeouts: u64,

    /// Frames that needed the second compression pass
    pub recompressed: u64,

    /// Frames that went through enhancement
    pub enhanced: u64,

    /// Enhancement failures or timeouts (frame kept unenhanced)
    pub enhancement_failures: u64,

    /// Mode applied to the most recent enhanced frame
    pub last_enhancement_mode: Option<EnhancementMode>,

    /// Total processing time (nanoseconds)
    pub total_processing_time_ns: u64,
}

impl ProcessingStats {
    /// Average processing time in milliseconds
    pub fn avg_processing_time_ms(&self) -> f64 {
        if self.frames_received == 0 {
            0.0
        } else {
            (self.total_processing_time_ns as f64 / self.frames_received as f64) / 1_000_000.0
        }
    }

    /// Share of received payloads that were passed through
    pub fn pass_through_rate(&self) -> f64 {
        if self.frames_received == 0 {
            0.0
        } else {
            self.frames_passed_through as f64 / self.frames_received as f64
        }
    }
}

/// Output of the encode stage
struct Encoded {
    jpeg: Vec<u8>,
    dimensions: (u32, u32),
    score: f32,
}

/// Frame processor
pub struct FrameProcessor {
    config: ProcessorConfig,
    tuning: Arc<PipelineTuning>,
    events: Arc<dyn EventSink>,
    stats: RwLock<ProcessingStats>,
    sequence: AtomicU64,
}

impl FrameProcessor {
    /// Create a processor reading quality from `tuning`
    pub fn new(config: ProcessorConfig, tuning: Arc<PipelineTuning>, events: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            tuning,
            events,
            stats: RwLock::new(ProcessingStats::default()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Get processing statistics
    pub fn stats(&self) -> ProcessingStats {
        self.stats.read().clone()
    }

    /// Reset statistics
    pub fn reset_stats(&self) {
        *self.stats.write() = ProcessingStats::default();
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Structural checks, cheap enough to run inline
    fn validate(&self, payload: &[u8]) -> Result<(), ProcessingError> {
        if payload.is_empty() {
            return Err(ProcessingError::Empty);
        }
        if payload.len() > self.config.max_frame_size {
            return Err(ProcessingError::TooLarge {
                size: payload.len(),
                limit: self.config.max_frame_size,
            });
        }
        Ok(())
    }

    /// Process one payload; always yields a frame
    pub async fn process(&self, payload: Bytes, captured_at: DateTime<Utc>) -> Frame {
        let started = Instant::now();
        let sequence = self.next_sequence();
        self.stats.write().frames_received += 1;

        if let Err(e) = self.validate(&payload) {
            debug!("Frame {} invalid: {}", sequence, e);
            self.stats.write().invalid_frames += 1;
            return self.pass_through(payload, captured_at, sequence, started);
        }

        if !self.config.processing_enabled {
            return self.pass_through(payload, captured_at, sequence, started);
        }

        match self.run_pipeline(payload.clone(), captured_at, started).await {
            Ok(encoded) => {
                let elapsed = started.elapsed();
                {
                    let mut stats = self.stats.write();
                    stats.frames_processed += 1;
                    stats.total_processing_time_ns += elapsed.as_nanos() as u64;
                }
                trace!("Frame {} processed in {:?} ({} bytes)", sequence, elapsed, encoded.jpeg.len());
                Frame {
                    payload: Bytes::from(encoded.jpeg),
                    captured_at,
                    sequence,
                    quality_score: encoded.score,
                    processing_latency: elapsed,
                    dimensions: Some(encoded.dimensions),
                    origin: FrameOrigin::Processed,
                }
            }
            Err(e) => {
                self.record_failure(sequence, &e);
                self.pass_through(payload, captured_at, sequence, started)
            }
        }
    }

    fn pass_through(&self, payload: Bytes, captured_at: DateTime<Utc>, sequence: u64, started: Instant) -> Frame {
        let elapsed = started.elapsed();
        {
            let mut stats = self.stats.write();
            stats.frames_passed_through += 1;
            stats.total_processing_time_ns += elapsed.as_nanos() as u64;
        }
        let mut frame = Frame::pass_through(payload, captured_at, sequence);
        frame.processing_latency = elapsed;
        frame
    }

    fn record_failure(&self, sequence: u64, error: &ProcessingError) {
        {
            let mut stats = self.stats.write();
            match error {
                ProcessingError::Decode(_) | ProcessingError::Dimensions(..) => stats.decode_failures += 1,
                ProcessingError::StageTimeout { .. } => stats.timeouts += 1,
                _ => stats.stage_failures += 1,
            }
        }
        match error {
            ProcessingError::StageTimeout { .. } => {
                warn!("Frame {} passed through: {}", sequence, error);
                self.events.emit_event(
                    &format!("Frame {} processing timeout: {}", sequence, error),
                    EventCategory::Processing,
                    Severity::Warning,
                );
            }
            _ => debug!("Frame {} passed through: {}", sequence, error),
        }
    }

    /// Run `job` on the blocking pool under the stage deadline, capped by
    /// what is left of the pipeline budget
    async fn run_stage<T, F>(&self, stage: Stage, deadline: Instant, job: F) -> Result<T, ProcessingError>
    where
        F: FnOnce() -> Result<T, ProcessingError> + Send + 'static,
        T: Send + 'static,
    {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let budget = remaining.min(self.config.stage_timeout());
        if budget.is_zero() {
            return Err(ProcessingError::StageTimeout { stage, budget });
        }
        match tokio::time::timeout(budget, tokio::task::spawn_blocking(job)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ProcessingError::Worker(join.to_string())),
            Err(_) => Err(ProcessingError::StageTimeout { stage, budget }),
        }
    }

    /// Enhance `image`; on failure the unenhanced image carries on
    async fn enhance_stage(&self, image: RgbImage, deadline: Instant) -> RgbImage {
        let source = Arc::new(image);
        let input = Arc::clone(&source);
        let config = self.config.enhancement.clone();
        let result = self
            .run_stage(Stage::Enhance, deadline, move || Ok(enhance::enhance(&input, &config)))
            .await;

        match result {
            Ok((enhanced, mode)) => {
                let mut stats = self.stats.write();
                stats.enhanced += 1;
                if stats.last_enhancement_mode != Some(mode) {
                    debug!("Enhancement mode now {}", mode);
                }
                stats.last_enhancement_mode = Some(mode);
                enhanced
            }
            Err(e) => {
                self.stats.write().enhancement_failures += 1;
                if matches!(e, ProcessingError::StageTimeout { .. }) {
                    self.events.emit_event(
                        &format!("Enhancement skipped: {}", e),
                        EventCategory::Processing,
                        Severity::Warning,
                    );
                }
                debug!("Keeping unenhanced image: {}", e);
                // A timed-out worker may still hold its reference.
                Arc::try_unwrap(source).unwrap_or_else(|shared| (*shared).clone())
            }
        }
    }

    async fn run_pipeline(
        &self,
        payload: Bytes,
        captured_at: DateTime<Utc>,
        started: Instant,
    ) -> Result<Encoded, ProcessingError> {
        let deadline = started + self.config.pipeline_budget();
        let quality = self.tuning.quality();
        let max_dimension = self.config.max_dimension;
        let (width, height) = (self.config.target_width, self.config.target_height);

        let image: RgbImage = self
            .run_stage(Stage::Decode, deadline, move || codec::decode(&payload, max_dimension))
            .await?;

        let image = self
            .run_stage(Stage::Resize, deadline, move || Ok(codec::resize_to(image, width, height)))
            .await?;

        let image = if self.config.enhancement.enabled {
            self.enhance_stage(image, deadline).await
        } else {
            image
        };

        let image = if self.config.overlay_enabled {
            self.run_stage(Stage::Overlay, deadline, move || {
                let mut image = image;
                overlay::stamp(&mut image, captured_at);
                Ok(image)
            })
            .await?
        } else {
            image
        };

        let scoring = self.config.scoring_enabled;
        let image = Arc::new(image);
        let source = Arc::clone(&image);
        let first = self
            .run_stage(Stage::Encode, deadline, move || {
                let jpeg = codec::encode_jpeg(&source, quality)?;
                let score = if scoring {
                    analysis::analyze(&source).score()
                } else {
                    DEFAULT_QUALITY_SCORE
                };
                Ok(Encoded {
                    jpeg,
                    dimensions: source.dimensions(),
                    score,
                })
            })
            .await?;

        if first.jpeg.len() <= self.config.compression_threshold {
            return Ok(first);
        }

        let second_quality = codec::compression_quality(
            quality,
            first.jpeg.len(),
            self.config.compression_target,
            self.config.min_compression_quality,
        );
        if second_quality >= quality {
            return Ok(first);
        }

        // From here on the first-pass output is the fallback.
        let source = Arc::clone(&image);
        match self
            .run_stage(Stage::Compress, deadline, move || codec::encode_jpeg(&source, second_quality))
            .await
        {
            Ok(jpeg) if jpeg.len() < first.jpeg.len() => {
                debug!(
                    "Recompressed {} -> {} bytes at quality {}",
                    first.jpeg.len(),
                    jpeg.len(),
                    second_quality
                );
                self.stats.write().recompressed += 1;
                Ok(Encoded { jpeg, ..first })
            }
            Ok(_) => Ok(first),
            Err(e) => {
                if matches!(e, ProcessingError::StageTimeout { .. }) {
                    self.stats.write().timeouts += 1;
                    self.events.emit_event(
                        &format!("Compression pass timed out: {}", e),
                        EventCategory::Processing,
                        Severity::Warning,
                    );
                }
                debug!("Keeping first-pass output: {}", e);
                Ok(first)
            }
        }
    }
}
