//! Camera and controller link handlers
//!
//! The camera handler is the head of the frame path:
//!
//! ```text
//! binary ──> FrameProcessor ──> FrameBuffer (latest slot) ──> pacing ──> viewers
//!                 │                   │
//!                 │                   └── evictions ──> PerformanceMonitor
//!                 └── latency ──> PerformanceMonitor
//!                         └─────────> Recorder
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::buffer::FrameBuffer;
use crate::events::{EventSink, Severity};
use crate::frame::Frame;
use crate::link::{role_category, CloseReason, ControlMessage, DeviceLink, LinkHandler};
use crate::performance::PerformanceMonitor;
use crate::processor::FrameProcessor;
use crate::recording::{FlushReason, RecorderHandle};

/// Handles device log and error reports common to both roles
fn report(link: &DeviceLink, events: &dyn EventSink, message: ControlMessage) {
    let role = link.role();
    match message {
        ControlMessage::Log { message, level } => {
            events.emit_event(
                &format!("{}: {}", role, message),
                role_category(role),
                Severity::from_level(&level),
            );
        }
        ControlMessage::PhotoError { message } => {
            link.record_error(&format!("photo error: {}", message));
            events.emit_event(
                &format!("{} failed to capture: {}", role, message),
                role_category(role),
                Severity::Warning,
            );
        }
        ControlMessage::SystemError { message } => {
            link.record_error(&format!("system error: {}", message));
            events.emit_event(
                &format!("{} system error: {}", role, message),
                role_category(role),
                Severity::Error,
            );
        }
        ControlMessage::Status { data } => {
            debug!("{} status report: {}", role, data.unwrap_or_default());
        }
        other => {
            debug!("{} link {}: ignoring {}", role, link.id(), other.kind());
        }
    }
}

/// Camera link handler
pub struct CameraIngest {
    processor: Arc<FrameProcessor>,
    buffer: Arc<FrameBuffer>,
    monitor: Arc<PerformanceMonitor>,
    recorder: Option<Arc<RecorderHandle>>,
    events: Arc<dyn EventSink>,
}

impl CameraIngest {
    /// Wire the frame path; `recorder` is `None` when recording is disabled
    pub fn new(
        processor: Arc<FrameProcessor>,
        buffer: Arc<FrameBuffer>,
        monitor: Arc<PerformanceMonitor>,
        recorder: Option<Arc<RecorderHandle>>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            processor,
            buffer,
            monitor,
            recorder,
            events,
        }
    }

    /// Run one payload through the frame path
    ///
    /// Returns the stored frame, or `None` when there was nothing to store.
    pub async fn ingest(&self, payload: Bytes) -> Option<Arc<Frame>> {
        let frame = self.processor.process(payload, Utc::now()).await;
        if frame.is_empty() {
            self.monitor.record_dropped(1);
            return None;
        }

        let frame = Arc::new(frame);
        let evicted = self.buffer.push(Arc::clone(&frame));
        self.monitor.record_dropped(evicted as u64);
        self.monitor.record_frame(frame.processing_latency);

        if let Some(recorder) = &self.recorder {
            if !recorder.submit(Arc::clone(&frame)) {
                trace!("Recorder queue full, frame {} not recorded", frame.sequence);
            }
        }
        Some(frame)
    }
}

#[async_trait]
impl LinkHandler for CameraIngest {
    async fn on_control(&self, link: &Arc<DeviceLink>, message: ControlMessage) {
        report(link, self.events.as_ref(), message);
    }

    async fn on_binary(&self, _link: &Arc<DeviceLink>, payload: Bytes) {
        self.ingest(payload).await;
    }

    async fn on_closed(&self, _link: &Arc<DeviceLink>, reason: &CloseReason) {
        // A superseding link keeps recording into the same segment.
        if matches!(reason, CloseReason::Superseded | CloseReason::Shutdown) {
            return;
        }
        if let Some(recorder) = &self.recorder {
            if !recorder.request_flush(FlushReason::Disconnect) {
                warn!("Recorder unavailable, disconnect flush skipped");
            }
        }
    }
}

/// Controller link handler
pub struct ControllerReports {
    events: Arc<dyn EventSink>,
}

impl ControllerReports {
    /// Report controller logs and errors to `events`
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl LinkHandler for ControllerReports {
    async fn on_control(&self, link: &Arc<DeviceLink>, message: ControlMessage) {
        report(link, self.events.as_ref(), message);
    }

    async fn on_binary(&self, link: &Arc<DeviceLink>, payload: Bytes) {
        debug!("Controller link {} sent {} unexpected binary bytes", link.id(), payload.len());
    }
}
