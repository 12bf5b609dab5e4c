//! Recorder task
//!
//! Single task that owns segment writing. Ingest hands frames over with
//! [`RecorderHandle::submit`], which never waits: when the queue is full the
//! frame is counted as rejected and the live path moves on.

use chrono::Utc;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::container::encode_segment;
use super::segment::SegmentState;
use super::session::{FlushJob, FlushReason, HealthReport, RecordingSession};
use super::store::{sweep_retention, SegmentCatalog, SegmentMetadata, SegmentWriter, StorageError};
use super::RecordingConfig;
use crate::events::{EventCategory, EventSink, Severity};
use crate::frame::Frame;
use crate::utils::RetryPolicy;

enum Command {
    Frame(Arc<Frame>),
    Flush(FlushReason),
}

/// Cloneable front of the recorder task
pub struct RecorderHandle {
    tx: mpsc::Sender<Command>,
    session: Arc<Mutex<RecordingSession>>,
    rejected: AtomicU64,
}

impl RecorderHandle {
    /// Queue a frame for recording; `false` when the queue is full or closed
    pub fn submit(&self, frame: Arc<Frame>) -> bool {
        match self.tx.try_send(Command::Frame(frame)) {
            Ok(()) => true,
            Err(e) => {
                let n = self.rejected.fetch_add(1, Ordering::Relaxed) + 1;
                if n == 1 || n % 100 == 0 {
                    warn!("Recorder queue unavailable ({}); {} frames not recorded", e, n);
                }
                false
            }
        }
    }

    /// Ask the recorder to flush whatever it holds
    pub fn request_flush(&self, reason: FlushReason) -> bool {
        self.tx.try_send(Command::Flush(reason)).is_ok()
    }

    /// Current health report
    pub fn health(&self) -> HealthReport {
        self.session.lock().health()
    }

    /// Frames that could not be queued
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Writes segments produced by a [`RecordingSession`]
pub struct Recorder {
    config: RecordingConfig,
    session: Arc<Mutex<RecordingSession>>,
    writer: SegmentWriter,
    catalog: Arc<dyn SegmentCatalog>,
    events: Arc<dyn EventSink>,
    retry: RetryPolicy,
    rx: mpsc::Receiver<Command>,
}

impl Recorder {
    /// Build the recorder and its handle
    pub fn new(
        config: RecordingConfig,
        catalog: Arc<dyn SegmentCatalog>,
        events: Arc<dyn EventSink>,
    ) -> (Self, Arc<RecorderHandle>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let session = Arc::new(Mutex::new(RecordingSession::new(config.clone())));
        let handle = Arc::new(RecorderHandle {
            tx,
            session: Arc::clone(&session),
            rejected: AtomicU64::new(0),
        });
        let recorder = Self {
            writer: SegmentWriter::new(config.directory.clone()),
            retry: config.retry.clone(),
            config,
            session,
            catalog,
            events,
            rx,
        };
        (recorder, handle)
    }

    /// Create the recordings directory
    pub async fn prepare(&self) -> Result<(), StorageError> {
        self.writer.ensure_root().await
    }

    /// Recordings root
    pub fn root(&self) -> PathBuf {
        self.writer.root().to_path_buf()
    }

    /// Run until `shutdown`, then drain the queue and flush everything
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Recorder started, writing to {}", self.writer.root().display());

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },

                _ = ticker.tick() => {
                    let jobs = self.session.lock().tick(Utc::now());
                    self.write_all(jobs).await;
                    self.health_pass();
                }
            }
        }

        // Frames already queued are still recorded.
        self.rx.close();
        while let Some(command) = self.rx.recv().await {
            if let Command::Frame(_) = command {
                self.handle(command).await;
            }
        }
        let jobs = self.session.lock().force_flush(FlushReason::Shutdown, Utc::now());
        self.write_all(jobs).await;
        info!("Recorder stopped");
    }

    async fn handle(&self, command: Command) {
        match command {
            Command::Frame(frame) => {
                let ready = self.session.lock().append(frame);
                if let Some(job) = ready {
                    self.write(job).await;
                }
            }
            Command::Flush(reason) => {
                let jobs = self.session.lock().force_flush(reason, Utc::now());
                self.write_all(jobs).await;
            }
        }
    }

    async fn write_all(&self, jobs: Vec<FlushJob>) {
        for job in jobs {
            self.write(job).await;
        }
    }

    fn health_pass(&self) {
        let report = self.session.lock().health();
        debug!(
            "Recording health {:.0}% ({} valid, {} mergeable, {} undersized, {} pending retries)",
            report.score, report.valid, report.mergeable, report.undersized, report.pending_retries
        );
        if report.pending_retries > 0 {
            self.events.emit_event(
                &format!("{} segments waiting for a storage retry", report.pending_retries),
                EventCategory::Recording,
                Severity::Warning,
            );
        }
    }

    async fn write(&self, mut job: FlushJob) {
        job.segment.state = SegmentState::Flushing;
        let number = job.segment.number;
        let frames = job.segment.frames.clone();

        let encoded = match tokio::task::spawn_blocking(move || encode_segment(number, &frames)).await {
            Ok(Ok(encoded)) => encoded,
            Ok(Err(e)) => {
                warn!("Segment {} dropped: {}", number, e);
                self.events.emit_event(
                    &format!("Segment {} discarded: {}", number, e),
                    EventCategory::Recording,
                    Severity::Error,
                );
                return;
            }
            Err(e) => {
                warn!("Segment {} encoder task failed: {}", number, e);
                self.session.lock().requeue(job);
                return;
            }
        };

        if !job.is_forced() && encoded.bytes.len() < self.config.absolute_min_size {
            debug!(
                "Segment {} is {} bytes (< {}); merging into the next segment",
                number,
                encoded.bytes.len(),
                self.config.absolute_min_size
            );
            self.session.lock().carry_forward(job, Utc::now());
            return;
        }

        let writer = &self.writer;
        let bytes = &encoded.bytes;
        let started_at = encoded.started_at;
        let written = self
            .retry
            .run("segment write", move || writer.write(number, started_at, bytes))
            .await;
        let path = match written {
            Ok(path) => path,
            Err(e) => {
                self.events.emit_event(
                    &format!("Segment {} write failed, will retry next cycle: {}", number, e),
                    EventCategory::Recording,
                    Severity::Warning,
                );
                self.session.lock().requeue(job);
                return;
            }
        };

        let metadata = SegmentMetadata {
            number,
            started_at: encoded.started_at,
            ended_at: encoded.ended_at,
            frame_count: encoded.frame_count,
            byte_size: encoded.bytes.len() as u64,
            substituted_frames: encoded.substituted,
            merged_from: job.segment.merged_from.clone(),
            forced: job.is_forced(),
        };
        let catalog = &self.catalog;
        let (path_ref, meta_ref) = (&path, &metadata);
        if let Err(e) = self
            .retry
            .run("segment catalog", move || catalog.persist_segment(path_ref, meta_ref))
            .await
        {
            self.events.emit_event(
                &format!("Segment {} written but not catalogued: {}", number, e),
                EventCategory::Recording,
                Severity::Warning,
            );
        }

        self.session.lock().complete(&job, encoded.bytes.len(), Utc::now());
        self.events.emit_event(
            &format!(
                "Segment {} saved: {} frames, {} bytes{}",
                number,
                encoded.frame_count,
                encoded.bytes.len(),
                if job.is_forced() { " (forced)" } else { "" }
            ),
            EventCategory::Recording,
            Severity::Info,
        );
    }
}

/// Periodic retention sweep of the recordings root
pub async fn run_retention(config: RecordingConfig, events: Arc<dyn EventSink>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(config.retention_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(cutoff) = SystemTime::now().checked_sub(config.retention()) else {
            continue;
        };
        let root = config.directory.clone();
        match tokio::task::spawn_blocking(move || sweep_retention(&root, cutoff)).await {
            Ok(Ok(report)) if report.removed_segments > 0 => events.emit_event(
                &format!("Retention removed {} expired segments", report.removed_segments),
                EventCategory::Recording,
                Severity::Info,
            ),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Retention sweep failed: {}", e),
            Err(e) => warn!("Retention sweep task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use crate::recording::store::INDEX_FILE;
    use crate::recording::{decode_segment, JsonIndexCatalog, MockSegmentCatalog};
    use bytes::Bytes;
    use image::{Rgb, RgbImage};

    fn jpeg_frame(seq: u64) -> Arc<Frame> {
        let img = RgbImage::from_pixel(8, 8, Rgb([seq as u8 * 20, 40, 60]));
        let mut out = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 80)
            .encode(img.as_raw(), 8, 8, image::ExtendedColorType::Rgb8)
            .unwrap();
        Arc::new(Frame::pass_through(Bytes::from(out), Utc::now(), seq))
    }

    fn config(dir: &std::path::Path) -> RecordingConfig {
        RecordingConfig {
            directory: dir.to_path_buf(),
            min_frames: 2,
            min_duration_secs: 0,
            target_duration_secs: 0,
            max_duration_secs: 60,
            absolute_min_size: 0,
            tick_interval_ms: 60_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ready_segment_written_and_catalogued() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MockSegmentCatalog::new();
        catalog
            .expect_persist_segment()
            .withf(|path, meta| path.exists() && meta.frame_count == 2 && !meta.forced)
            .times(1)
            .returning(|_, _| Ok(()));

        let events = Arc::new(EventLog::new(16));
        let (recorder, handle) = Recorder::new(config(dir.path()), Arc::new(catalog), events.clone());
        recorder.prepare().await.unwrap();

        assert!(handle.submit(jpeg_frame(0)));
        assert!(handle.submit(jpeg_frame(1)));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(recorder.run(shutdown.clone()));
        shutdown.cancel();
        task.await.unwrap();

        let report = handle.health();
        assert_eq!(report.valid, 1);
        assert!(events.recent(16).iter().any(|e| e.message.starts_with("Segment 1 saved")));
    }

    #[tokio::test]
    async fn test_undersized_output_merged_then_flushed_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RecordingConfig {
            min_frames: 1,
            absolute_min_size: 10 * 1024 * 1024,
            ..config(dir.path())
        };
        let catalog = Arc::new(JsonIndexCatalog::new(dir.path()));
        let (recorder, handle) = Recorder::new(cfg, catalog.clone(), Arc::new(EventLog::new(16)));
        recorder.prepare().await.unwrap();

        assert!(handle.submit(jpeg_frame(0)));
        assert!(handle.submit(jpeg_frame(1)));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(recorder.run(shutdown.clone()));
        shutdown.cancel();
        task.await.unwrap();

        let index = std::fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap();
        let lines: Vec<serde_json::Value> = index.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["frame_count"], 2);
        assert_eq!(lines[0]["forced"], true);
        assert_eq!(lines[0]["merged_from"], serde_json::json!([1, 2]));

        let path = lines[0]["path"].as_str().unwrap();
        let decoded = decode_segment(Bytes::from(std::fs::read(path).unwrap())).unwrap();
        assert_eq!(decoded.frames.len(), 2);
        assert_eq!(handle.health().mergeable, 2);
    }

    #[tokio::test]
    async fn test_storage_failure_requeues() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the recordings root should be makes every write fail.
        let blocked = dir.path().join("not-a-dir");
        std::fs::write(&blocked, b"x").unwrap();
        let cfg = RecordingConfig {
            retry: RetryPolicy {
                max_attempts: 1,
                ..Default::default()
            },
            ..config(&blocked)
        };
        let catalog = MockSegmentCatalog::new();
        let (recorder, handle) = Recorder::new(cfg, Arc::new(catalog), Arc::new(EventLog::new(16)));

        assert!(handle.submit(jpeg_frame(0)));
        assert!(handle.submit(jpeg_frame(1)));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(recorder.run(shutdown.clone()));
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(handle.health().pending_retries, 1);
    }

    #[test]
    fn test_submit_reports_full_queue() {
        let cfg = RecordingConfig {
            queue_capacity: 1,
            ..Default::default()
        };
        let (_recorder, handle) = Recorder::new(cfg, Arc::new(MockSegmentCatalog::new()), Arc::new(EventLog::new(4)));
        assert!(handle.submit(jpeg_frame(0)));
        assert!(!handle.submit(jpeg_frame(1)));
        assert_eq!(handle.rejected(), 1);
    }
}
