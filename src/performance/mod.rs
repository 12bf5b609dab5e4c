//! Performance feedback loop
//!
//! This module contains the adaptive parts of the pipeline:
//! - **Monitor**: sliding window of frame timings, aggregated into a
//!   [`PerformanceSnapshot`]
//! - **Quality Controller**: hysteresis rules that pick encode quality and
//!   the pacing compensation factor
//! - **Tuning**: the shared knobs the controller writes and the pipeline reads
//!
//! # Architecture
//!
//! ```text
//! Ingest ──record──> PerformanceMonitor
//!                          │ snapshot (every tick)
//!                          ▼
//!                   QualityController
//!                          │ apply
//!                          ▼
//!                   PipelineTuning ──quality──> FrameProcessor
//!                          └────compensation──> BroadcastHub pacing
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use vigil_server::performance::{
//!     MonitorConfig, PerformanceMonitor, PipelineTuning, QualityConfig, QualityController,
//! };
//!
//! let monitor = PerformanceMonitor::new(MonitorConfig::default());
//! let mut controller = QualityController::new(QualityConfig::default());
//! let tuning = PipelineTuning::new(controller.quality());
//!
//! // On every controller tick:
//! let decision = controller.evaluate(&monitor.snapshot(0.5));
//! tuning.apply(&decision);
//! ```

mod monitor;
mod quality;
mod tuning;

pub use monitor::{MonitorConfig, PerformanceMonitor, PerformanceSnapshot};
pub use quality::{FpsBand, QualityConfig, QualityController, QualityDecision, QualityStats};
pub use tuning::PipelineTuning;
