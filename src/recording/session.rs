//! Segment bookkeeping
//!
//! [`RecordingSession`] is the synchronous core of the recorder. It owns the
//! active segment, the frames carried over from merged segments and the
//! retry queue, and hands complete segments out as [`FlushJob`]s. It never
//! touches storage; the async [`Recorder`](super::Recorder) writes the jobs
//! and reports back through [`RecordingSession::complete`],
//! [`RecordingSession::carry_forward`] or [`RecordingSession::requeue`].
//!
//! Readiness needs BOTH `min_frames` and `min_duration`. An eligible segment
//! is handed out once it reaches `target_duration`. A segment that hits
//! `max_duration` is handed out if eligible; otherwise it is marked
//! `merged` and its frames start the next segment.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::segment::{RecordingSegment, SegmentState};
use super::RecordingConfig;
use crate::frame::Frame;

/// Why a segment was flushed before it was ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    /// Reached readiness normally
    Ready,
    /// Camera link closed
    Disconnect,
    /// Process shutting down
    Shutdown,
    /// Carried frames grew too old
    Straggler,
    /// Operator request
    Manual,
}

impl FlushReason {
    /// Forced flushes bypass readiness and the minimum size check
    pub fn is_forced(self) -> bool {
        !matches!(self, Self::Ready)
    }
}

/// A segment handed to the writer
#[derive(Debug, Clone)]
pub struct FlushJob {
    /// Segment to write
    pub segment: RecordingSegment,
    /// Why it is being written
    pub reason: FlushReason,
    /// Failed write cycles so far
    pub attempts: u32,
}

impl FlushJob {
    /// Whether readiness was bypassed
    pub fn is_forced(&self) -> bool {
        self.reason.is_forced()
    }
}

/// Health classification of a finished segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentHealth {
    /// Written and large enough
    Valid,
    /// Folded into a later segment
    Mergeable,
    /// Written below minimum frames or size (forced flush)
    Undersized,
}

/// Outcome of one segment, kept for the health pass
#[derive(Debug, Clone, Serialize)]
pub struct SegmentRecord {
    /// Segment number
    pub number: u64,
    /// Final state
    pub state: SegmentState,
    /// Frames in the segment
    pub frame_count: usize,
    /// Bytes written (or held, when merged)
    pub byte_size: usize,
    /// Classification
    pub health: SegmentHealth,
    /// When the outcome was recorded
    pub at: DateTime<Utc>,
}

/// Result of the periodic health pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    /// Recent segments scored
    pub total: usize,
    /// Standalone segments of proper size
    pub valid: usize,
    /// Segments folded into a successor
    pub mergeable: usize,
    /// Segments written below the minimums
    pub undersized: usize,
    /// `valid / total * 100`, 100 when nothing was scored
    pub score: f64,
    /// Frames in the active segment
    pub active_frames: usize,
    /// Frames waiting in merged carry-over
    pub carried_frames: usize,
    /// Segments waiting for a storage retry
    pub pending_retries: usize,
    /// Segments abandoned because the retry queue was full
    pub dropped_retries: u64,
}

/// Segment state machine for one camera stream
pub struct RecordingSession {
    config: RecordingConfig,
    active: Option<RecordingSegment>,
    carry: Option<RecordingSegment>,
    retry_queue: VecDeque<FlushJob>,
    dropped_retries: u64,
    history: VecDeque<SegmentRecord>,
    next_number: u64,
}

impl RecordingSession {
    /// Empty session
    pub fn new(config: RecordingConfig) -> Self {
        Self {
            config,
            active: None,
            carry: None,
            retry_queue: VecDeque::new(),
            dropped_retries: 0,
            history: VecDeque::new(),
            next_number: 1,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &RecordingConfig {
        &self.config
    }

    /// Segment currently collecting
    pub fn active(&self) -> Option<&RecordingSegment> {
        self.active.as_ref()
    }

    fn open_segment(&mut self, now: DateTime<Utc>) -> RecordingSegment {
        let number = self.next_number;
        self.next_number += 1;
        let mut segment = RecordingSegment::new(number, now);
        // Carried frames start the new segment, in capture order.
        if let Some(carry) = self.carry.take() {
            let mut from = carry.merged_from.clone();
            from.push(carry.number);
            segment.prepend(carry.frames, &from);
        }
        debug!("Segment {} opened", number);
        segment
    }

    fn is_eligible(&self, segment: &RecordingSegment, now: DateTime<Utc>) -> bool {
        segment.frame_count() >= self.config.min_frames
            && segment.elapsed(now) >= self.config.min_duration()
    }

    fn has_straggler(&self, segment: &RecordingSegment, now: DateTime<Utc>) -> bool {
        !segment.merged_from.is_empty()
            && segment
                .oldest_frame_at()
                .and_then(|oldest| (now - oldest).to_std().ok())
                .is_some_and(|age| age >= self.config.straggler_max_age())
    }

    /// Add a frame to the active segment
    ///
    /// Returns the segment if it became ready with this frame.
    pub fn append(&mut self, frame: Arc<Frame>) -> Option<FlushJob> {
        let now = frame.captured_at;
        let mut segment = match self.active.take() {
            Some(segment) => segment,
            None => self.open_segment(now),
        };
        segment.push(frame);
        self.active = Some(segment);
        self.evaluate(now, false)
    }

    /// Periodic check: maximum ceiling, stragglers, retry queue
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<FlushJob> {
        let mut jobs: Vec<FlushJob> = self.retry_queue.drain(..).collect();

        // Carry-over with no new frames to join it.
        if self.active.is_none() {
            if let Some(carry) = self.carry.as_ref() {
                let candidate = RecordingSegment {
                    merged_from: vec![carry.number],
                    ..carry.clone()
                };
                if self.has_straggler(&candidate, now) {
                    let segment = self.open_segment(now);
                    self.active = Some(segment);
                }
            }
        }

        if let Some(job) = self.evaluate(now, true) {
            jobs.push(job);
        }
        jobs
    }

    fn evaluate(&mut self, now: DateTime<Utc>, ceiling: bool) -> Option<FlushJob> {
        let segment = self.active.as_ref()?;
        if segment.is_empty() {
            return None;
        }

        if self.has_straggler(segment, now) {
            info!(
                "Segment {} holds carried frames older than {:?}; flushing",
                segment.number,
                self.config.straggler_max_age()
            );
            return self.take_active(FlushReason::Straggler);
        }

        let elapsed = segment.elapsed(now);
        let eligible = self.is_eligible(segment, now);

        if eligible && elapsed >= self.config.target_duration() {
            return self.take_active(FlushReason::Ready);
        }

        if elapsed >= self.config.max_duration() && (ceiling || !eligible) {
            if eligible {
                return self.take_active(FlushReason::Ready);
            }
            self.merge_active(now);
        }
        None
    }

    fn take_active(&mut self, reason: FlushReason) -> Option<FlushJob> {
        let mut segment = self.active.take()?;
        segment.state = if reason.is_forced() {
            SegmentState::Flushing
        } else {
            SegmentState::Ready
        };
        debug!(
            "Segment {} handed out ({:?}, {} frames, {} bytes)",
            segment.number,
            reason,
            segment.frame_count(),
            segment.byte_size
        );
        Some(FlushJob {
            segment,
            reason,
            attempts: 0,
        })
    }

    /// Undersized segment at the ceiling: its frames open the next segment
    fn merge_active(&mut self, now: DateTime<Utc>) {
        if let Some(segment) = self.active.take() {
            debug!(
                "Segment {} below minimum frames at ceiling ({} < {}); merging forward",
                segment.number,
                segment.frame_count(),
                self.config.min_frames
            );
            self.fold_into_carry(segment, now);
        }
    }

    fn fold_into_carry(&mut self, mut segment: RecordingSegment, now: DateTime<Utc>) {
        self.record(&segment, SegmentState::Merged, SegmentHealth::Mergeable, now);
        segment.state = SegmentState::Merged;
        let mut carried = match self.carry.take() {
            Some(mut earlier) => {
                let mut from = earlier.merged_from.clone();
                from.push(earlier.number);
                segment.prepend(std::mem::take(&mut earlier.frames), &from);
                segment
            }
            None => segment,
        };
        carried.started_at = now;
        self.carry = Some(carried);
    }

    /// Flush everything held, regardless of readiness
    pub fn force_flush(&mut self, reason: FlushReason, now: DateTime<Utc>) -> Vec<FlushJob> {
        let mut jobs: Vec<FlushJob> = self.retry_queue.drain(..).collect();
        if self.active.is_none() && self.carry.is_some() {
            let segment = self.open_segment(now);
            self.active = Some(segment);
        }
        if self.active.as_ref().is_some_and(|s| !s.is_empty()) {
            let forced = if reason.is_forced() { reason } else { FlushReason::Manual };
            if let Some(job) = self.take_active(forced) {
                jobs.push(job);
            }
        } else {
            self.active = None;
        }
        jobs
    }

    /// Writer finished a job
    pub fn complete(&mut self, job: &FlushJob, written_bytes: usize, now: DateTime<Utc>) {
        let undersized = job.segment.frame_count() < self.config.min_frames
            || written_bytes < self.config.absolute_min_size;
        let health = if undersized {
            SegmentHealth::Undersized
        } else {
            SegmentHealth::Valid
        };
        let mut record = job.segment.clone();
        record.byte_size = written_bytes;
        self.record(&record, SegmentState::Flushed, health, now);
    }

    /// Writer produced an artifact below the absolute minimum size
    pub fn carry_forward(&mut self, job: FlushJob, now: DateTime<Utc>) {
        let segment = job.segment;
        // An open segment already holds newer frames: carried ones go in front.
        if let Some(mut active) = self.active.take() {
            self.record(&segment, SegmentState::Merged, SegmentHealth::Mergeable, now);
            let mut from = segment.merged_from.clone();
            from.push(segment.number);
            active.prepend(segment.frames, &from);
            self.active = Some(active);
        } else {
            self.fold_into_carry(segment, now);
        }
    }

    /// Writer gave up on a job; retried on the next cycle
    ///
    /// The job keeps its state and reason. When storage keeps failing the
    /// queue is capped at `retry_queue_limit` and the oldest job is dropped.
    pub fn requeue(&mut self, mut job: FlushJob) {
        job.attempts += 1;
        self.retry_queue.push_back(job);
        while self.retry_queue.len() > self.config.retry_queue_limit.max(1) {
            if let Some(dropped) = self.retry_queue.pop_front() {
                self.dropped_retries += 1;
                warn!(
                    "Retry queue full ({}); dropping segment {} ({:?}, {} frames, {} attempts)",
                    self.config.retry_queue_limit,
                    dropped.segment.number,
                    dropped.reason,
                    dropped.segment.frame_count(),
                    dropped.attempts
                );
            }
        }
    }

    fn record(&mut self, segment: &RecordingSegment, state: SegmentState, health: SegmentHealth, now: DateTime<Utc>) {
        if self.history.len() >= self.config.health_window.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(SegmentRecord {
            number: segment.number,
            state,
            frame_count: segment.frame_count(),
            byte_size: segment.byte_size,
            health,
            at: now,
        });
    }

    /// Recent segment outcomes, oldest first
    pub fn history(&self) -> impl Iterator<Item = &SegmentRecord> {
        self.history.iter()
    }

    /// Score recent segments
    pub fn health(&self) -> HealthReport {
        let mut report = HealthReport {
            total: self.history.len(),
            active_frames: self.active.as_ref().map_or(0, |s| s.frame_count()),
            carried_frames: self.carry.as_ref().map_or(0, |s| s.frame_count()),
            pending_retries: self.retry_queue.len(),
            dropped_retries: self.dropped_retries,
            ..Default::default()
        };
        for record in &self.history {
            match record.health {
                SegmentHealth::Valid => report.valid += 1,
                SegmentHealth::Mergeable => report.mergeable += 1,
                SegmentHealth::Undersized => report.undersized += 1,
            }
        }
        report.score = if report.total == 0 {
            100.0
        } else {
            report.valid as f64 / report.total as f64 * 100.0
        };
        report
    }
}
