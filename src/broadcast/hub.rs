//! Viewer registry and frame fan-out

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::viewer::ViewerSink;
use super::{BroadcastConfig, BroadcastError};
use crate::buffer::FrameBuffer;
use crate::frame::Frame;
use crate::performance::PipelineTuning;

const NONE_YET: u64 = u64::MAX;

/// Why a viewer left the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictReason {
    /// Too many consecutive failed or overdue sends
    SendFailures,
    /// Viewer session ended
    Disconnected,
    /// Server shutting down
    Shutdown,
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SendFailures => write!(f, "too many failed sends"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Shutdown => write!(f, "server shutting down"),
        }
    }
}

/// Public view of one viewer
#[derive(Debug, Clone, Serialize)]
pub struct ViewerConnection {
    /// Viewer id
    pub id: Uuid,
    /// Principal the viewer authenticated as
    pub principal: String,
    /// Registration time
    pub joined_at: DateTime<Utc>,
    /// Sequence of the last frame written successfully
    pub last_sent_sequence: Option<u64>,
    /// Current strike count
    pub consecutive_failures: u32,
}

/// Hub counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct HubStats {
    /// Connected viewers
    pub viewers: usize,
    /// publish() calls
    pub published: u64,
    /// Frames placed in a viewer mailbox
    pub handed_off: u64,
    /// Frames written to a viewer
    pub delivered: u64,
    /// Hand-offs skipped because the viewer was still busy
    pub skipped_busy: u64,
    /// Viewers evicted for failures
    pub evicted: u64,
    /// Events dropped on full viewer mailboxes
    pub events_dropped: u64,
}

/// Returned by [`BroadcastHub::register`]
#[derive(Debug, Clone)]
pub struct ViewerTicket {
    /// Viewer id
    pub id: Uuid,
    /// Cancelled when the viewer leaves the hub for any reason
    pub closed: CancellationToken,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    handed_off: AtomicU64,
    delivered: AtomicU64,
    skipped_busy: AtomicU64,
    evicted: AtomicU64,
    events_dropped: AtomicU64,
}

struct ViewerSlot {
    id: Uuid,
    principal: String,
    joined_at: DateTime<Utc>,
    frames: watch::Sender<Option<Arc<Frame>>>,
    events: mpsc::Sender<Arc<str>>,
    in_flight: AtomicBool,
    failures: AtomicU32,
    last_handed: AtomicU64,
    last_sent: AtomicU64,
    leave_reason: Mutex<Option<EvictReason>>,
    closed: CancellationToken,
}

impl ViewerSlot {
    fn strike(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn already_handed(&self, sequence: u64) -> bool {
        let last = self.last_handed.load(Ordering::Acquire);
        last != NONE_YET && last >= sequence
    }

    fn connection(&self) -> ViewerConnection {
        let last = self.last_sent.load(Ordering::Acquire);
        ViewerConnection {
            id: self.id,
            principal: self.principal.clone(),
            joined_at: self.joined_at,
            last_sent_sequence: (last != NONE_YET).then_some(last),
            consecutive_failures: self.failures.load(Ordering::Acquire),
        }
    }
}

/// Fan-out of frames and status events to viewers
pub struct BroadcastHub {
    config: BroadcastConfig,
    viewers: Mutex<HashMap<Uuid, Arc<ViewerSlot>>>,
    counters: Arc<Counters>,
}

impl BroadcastHub {
    /// Create a hub
    pub fn new(config: BroadcastConfig) -> Arc<Self> {
        info!(
            "Broadcast hub: max {} viewers, {} strikes, {:.1} fps nominal",
            config.max_viewers, config.max_consecutive_failures, config.pacing_fps
        );
        Arc::new(Self {
            config,
            viewers: Mutex::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    /// Add a viewer and start its writer task
    pub fn register(
        self: &Arc<Self>,
        principal: impl Into<String>,
        sink: Box<dyn ViewerSink>,
    ) -> Result<ViewerTicket, BroadcastError> {
        let (frames_tx, frames_rx) = watch::channel(None);
        let (events_tx, events_rx) = mpsc::channel(self.config.event_capacity.max(1));
        let slot = Arc::new(ViewerSlot {
            id: Uuid::new_v4(),
            principal: principal.into(),
            joined_at: Utc::now(),
            frames: frames_tx,
            events: events_tx,
            in_flight: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            last_handed: AtomicU64::new(NONE_YET),
            last_sent: AtomicU64::new(NONE_YET),
            leave_reason: Mutex::new(None),
            closed: CancellationToken::new(),
        });

        let count = {
            let mut viewers = self.viewers.lock();
            if viewers.len() >= self.config.max_viewers {
                return Err(BroadcastError::TooManyViewers(self.config.max_viewers));
            }
            viewers.insert(slot.id, Arc::clone(&slot));
            viewers.len()
        };
        info!("Viewer {} ({}) joined, {} connected", slot.id, slot.principal, count);

        let writer = Writer {
            hub: Arc::downgrade(self),
            slot: Arc::clone(&slot),
            counters: Arc::clone(&self.counters),
            send_timeout: self.config.send_timeout(),
            max_failures: self.config.max_consecutive_failures,
        };
        tokio::spawn(writer.run(sink, frames_rx, events_rx));

        Ok(ViewerTicket {
            id: slot.id,
            closed: slot.closed.clone(),
        })
    }

    /// Hand `frame` to every viewer that is ready for it
    ///
    /// Never waits on a viewer. A viewer still writing an older frame gets a
    /// strike instead; returns how many mailboxes received the frame.
    pub fn publish(&self, frame: Arc<Frame>) -> usize {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let slots: Vec<Arc<ViewerSlot>> = self.viewers.lock().values().cloned().collect();

        let mut handed = 0;
        let mut evict = Vec::new();
        for slot in slots {
            if slot.already_handed(frame.sequence) {
                continue;
            }
            if slot.in_flight.load(Ordering::Acquire) {
                self.counters.skipped_busy.fetch_add(1, Ordering::Relaxed);
                let strikes = slot.strike();
                trace!("Viewer {} busy at frame {}, strike {}", slot.id, frame.sequence, strikes);
                if strikes >= self.config.max_consecutive_failures {
                    evict.push(slot.id);
                }
                continue;
            }
            slot.in_flight.store(true, Ordering::Release);
            slot.last_handed.store(frame.sequence, Ordering::Release);
            slot.frames.send_replace(Some(Arc::clone(&frame)));
            handed += 1;
        }

        self.counters.handed_off.fetch_add(handed as u64, Ordering::Relaxed);
        for id in evict {
            self.evict(id, EvictReason::SendFailures);
        }
        handed
    }

    /// Queue a JSON text event for every viewer
    pub fn publish_event(&self, text: &str) -> usize {
        let text: Arc<str> = Arc::from(text);
        let slots: Vec<Arc<ViewerSlot>> = self.viewers.lock().values().cloned().collect();
        slots
            .iter()
            .filter(|slot| self.enqueue(slot, Arc::clone(&text)))
            .count()
    }

    /// Queue a text message for one viewer
    pub fn send_to(&self, id: Uuid, text: &str) -> bool {
        let slot = self.viewers.lock().get(&id).cloned();
        match slot {
            Some(slot) => self.enqueue(&slot, Arc::from(text)),
            None => false,
        }
    }

    fn enqueue(&self, slot: &ViewerSlot, text: Arc<str>) -> bool {
        match slot.events.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Viewer {} event mailbox full, dropping event", slot.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Remove a viewer; returns false when it was already gone
    pub fn evict(&self, id: Uuid, reason: EvictReason) -> bool {
        let (slot, remaining) = {
            let mut viewers = self.viewers.lock();
            let slot = viewers.remove(&id);
            (slot, viewers.len())
        };
        let Some(slot) = slot else {
            return false;
        };

        *slot.leave_reason.lock() = Some(reason);
        slot.closed.cancel();
        match reason {
            EvictReason::SendFailures => {
                self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                warn!("Viewer {} evicted: {}, {} connected", id, reason, remaining);
            }
            _ => info!("Viewer {} left: {}, {} connected", id, reason, remaining),
        }
        true
    }

    /// Remove a viewer whose session ended
    pub fn unregister(&self, id: Uuid) -> bool {
        self.evict(id, EvictReason::Disconnected)
    }

    /// Remove every viewer
    pub fn close_all(&self, reason: EvictReason) {
        let ids: Vec<Uuid> = self.viewers.lock().keys().copied().collect();
        for id in ids {
            self.evict(id, reason);
        }
    }

    /// Connected viewers
    pub fn viewer_count(&self) -> usize {
        self.viewers.lock().len()
    }

    /// Snapshot of connected viewers
    pub fn viewers(&self) -> Vec<ViewerConnection> {
        let slots: Vec<Arc<ViewerSlot>> = self.viewers.lock().values().cloned().collect();
        slots.iter().map(|slot| slot.connection()).collect()
    }

    /// Counter snapshot
    pub fn stats(&self) -> HubStats {
        HubStats {
            viewers: self.viewer_count(),
            published: self.counters.published.load(Ordering::Relaxed),
            handed_off: self.counters.handed_off.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            skipped_busy: self.counters.skipped_busy.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            events_dropped: self.counters.events_dropped.load(Ordering::Relaxed),
        }
    }

    /// Publish the buffer's latest frame every pacing interval
    ///
    /// The interval is re-read each tick so compensation changes apply
    /// immediately. All viewers are closed on shutdown.
    pub async fn run_pacing(
        self: Arc<Self>,
        buffer: Arc<FrameBuffer>,
        tuning: Arc<PipelineTuning>,
        shutdown: CancellationToken,
    ) {
        debug!("Broadcast pacing started");
        loop {
            let interval = self.config.pacing_interval(tuning.compensation());
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Some(frame) = buffer.latest() {
                self.publish(frame);
            }
        }
        self.close_all(EvictReason::Shutdown);
        debug!("Broadcast pacing stopped");
    }
}

struct Writer {
    hub: Weak<BroadcastHub>,
    slot: Arc<ViewerSlot>,
    counters: Arc<Counters>,
    send_timeout: Duration,
    max_failures: u32,
}

impl Writer {
    async fn run(
        self,
        mut sink: Box<dyn ViewerSink>,
        mut frames: watch::Receiver<Option<Arc<Frame>>>,
        mut events: mpsc::Receiver<Arc<str>>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = self.slot.closed.cancelled() => break,

                Some(text) = events.recv() => {
                    let outcome = self.guarded(sink.send_text(&text)).await;
                    if let Err(e) = outcome {
                        if self.fail(e) {
                            break;
                        }
                    }
                }

                changed = frames.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let frame = frames.borrow_and_update().clone();
                    let Some(frame) = frame else {
                        self.slot.in_flight.store(false, Ordering::Release);
                        continue;
                    };
                    let outcome = self.guarded(sink.send_frame(&frame)).await;
                    self.slot.in_flight.store(false, Ordering::Release);
                    match outcome {
                        Ok(()) => {
                            self.slot.last_sent.store(frame.sequence, Ordering::Release);
                            self.slot.failures.store(0, Ordering::Release);
                            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(BroadcastError::Closed) => break,
                        Err(e) => {
                            if self.fail(e) {
                                break;
                            }
                        }
                    }
                }
            }
        }

        let reason = (*self.slot.leave_reason.lock()).unwrap_or(EvictReason::Disconnected);
        sink.close(reason).await;
        trace!("Viewer {} writer finished", self.slot.id);
    }

    /// Run a send under the deadline, abandoning it if the viewer leaves
    async fn guarded<F>(&self, send: F) -> Result<(), BroadcastError>
    where
        F: Future<Output = Result<(), BroadcastError>>,
    {
        tokio::select! {
            biased;
            _ = self.slot.closed.cancelled() => Err(BroadcastError::Closed),
            outcome = tokio::time::timeout(self.send_timeout, send) => match outcome {
                Ok(result) => result,
                Err(_) => Err(BroadcastError::SendTimeout(self.send_timeout)),
            },
        }
    }

    /// Count a failed send; true when the viewer was evicted
    fn fail(&self, error: BroadcastError) -> bool {
        let strikes = self.slot.strike();
        debug!("Viewer {} send failed ({}/{}): {}", self.slot.id, strikes, self.max_failures, error);
        if strikes < self.max_failures {
            return false;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.evict(self.slot.id, EvictReason::SendFailures);
        } else {
            self.slot.closed.cancel();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FrameBufferConfig;
    use async_trait::async_trait;
    use bytes::Bytes;

    #[derive(Clone, Default)]
    struct CollectSink {
        frames: Arc<Mutex<Vec<u64>>>,
        texts: Arc<Mutex<Vec<String>>>,
        closed_with: Arc<Mutex<Option<EvictReason>>>,
    }

    #[async_trait]
    impl ViewerSink for CollectSink {
        async fn send_frame(&mut self, frame: &Frame) -> Result<(), BroadcastError> {
            self.frames.lock().push(frame.sequence);
            Ok(())
        }

        async fn send_text(&mut self, text: &str) -> Result<(), BroadcastError> {
            self.texts.lock().push(text.to_string());
            Ok(())
        }

        async fn close(&mut self, reason: EvictReason) {
            *self.closed_with.lock() = Some(reason);
        }
    }

    struct StuckSink;

    #[async_trait]
    impl ViewerSink for StuckSink {
        async fn send_frame(&mut self, _frame: &Frame) -> Result<(), BroadcastError> {
            std::future::pending().await
        }

        async fn send_text(&mut self, _text: &str) -> Result<(), BroadcastError> {
            std::future::pending().await
        }

        async fn close(&mut self, _reason: EvictReason) {}
    }

    struct BrokenSink;

    #[async_trait]
    impl ViewerSink for BrokenSink {
        async fn send_frame(&mut self, _frame: &Frame) -> Result<(), BroadcastError> {
            Err(BroadcastError::Send("broken pipe".to_string()))
        }

        async fn send_text(&mut self, _text: &str) -> Result<(), BroadcastError> {
            Err(BroadcastError::Send("broken pipe".to_string()))
        }

        async fn close(&mut self, _reason: EvictReason) {}
    }

    fn frame(sequence: u64) -> Arc<Frame> {
        Arc::new(Frame::pass_through(Bytes::from_static(b"\xff\xd8jpeg"), Utc::now(), sequence))
    }

    fn hub() -> Arc<BroadcastHub> {
        BroadcastHub::new(BroadcastConfig {
            send_timeout_ms: 60_000,
            ..Default::default()
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    #[tokio::test]
    async fn test_stuck_viewer_evicted_others_unaffected() {
        let hub = hub();
        let healthy: Vec<CollectSink> = (0..3).map(|_| CollectSink::default()).collect();
        for sink in &healthy {
            hub.register("viewer", Box::new(sink.clone())).unwrap();
        }
        let stuck = hub.register("slow", Box::new(StuckSink)).unwrap();
        assert_eq!(hub.viewer_count(), 4);

        for sequence in 0..4 {
            hub.publish(frame(sequence));
            settle().await;
        }

        assert!(stuck.closed.is_cancelled());
        assert_eq!(hub.viewer_count(), 3);
        assert_eq!(hub.stats().evicted, 1);
        for sink in &healthy {
            assert_eq!(*sink.frames.lock(), vec![0, 1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_failing_viewer_evicted_after_three_strikes() {
        let hub = hub();
        let ticket = hub.register("broken", Box::new(BrokenSink)).unwrap();

        hub.publish(frame(0));
        settle().await;
        hub.publish(frame(1));
        settle().await;
        assert_eq!(hub.viewers()[0].consecutive_failures, 2);
        assert!(!ticket.closed.is_cancelled());

        hub.publish(frame(2));
        settle().await;
        assert!(ticket.closed.is_cancelled());
        assert_eq!(hub.viewer_count(), 0);
    }

    #[tokio::test]
    async fn test_republishing_same_frame_is_not_a_strike() {
        let hub = hub();
        hub.register("slow", Box::new(StuckSink)).unwrap();

        let latest = frame(7);
        for _ in 0..5 {
            hub.publish(Arc::clone(&latest));
        }
        settle().await;

        let viewers = hub.viewers();
        assert_eq!(viewers.len(), 1);
        assert_eq!(viewers[0].consecutive_failures, 0);
        assert_eq!(hub.stats().handed_off, 1);
    }

    #[tokio::test]
    async fn test_success_clears_strikes() {
        let hub = hub();
        let sink = CollectSink::default();
        hub.register("viewer", Box::new(sink.clone())).unwrap();

        hub.publish(frame(0));
        settle().await;
        let viewer = &hub.viewers()[0];
        assert_eq!(viewer.last_sent_sequence, Some(0));
        assert_eq!(viewer.consecutive_failures, 0);
        assert_eq!(hub.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_viewer_limit() {
        let hub = BroadcastHub::new(BroadcastConfig {
            max_viewers: 1,
            ..Default::default()
        });
        hub.register("a", Box::new(CollectSink::default())).unwrap();
        let refused = hub.register("b", Box::new(CollectSink::default()));
        assert_eq!(refused.unwrap_err(), BroadcastError::TooManyViewers(1));
    }

    #[tokio::test]
    async fn test_events_and_direct_messages() {
        let hub = hub();
        let a = CollectSink::default();
        let b = CollectSink::default();
        let ticket_a = hub.register("a", Box::new(a.clone())).unwrap();
        hub.register("b", Box::new(b.clone())).unwrap();

        assert_eq!(hub.publish_event(r#"{"type":"status"}"#), 2);
        assert!(hub.send_to(ticket_a.id, r#"{"type":"pong"}"#));
        assert!(!hub.send_to(Uuid::new_v4(), "nobody"));
        settle().await;

        assert_eq!(a.texts.lock().len(), 2);
        assert_eq!(b.texts.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_closes_writer() {
        let hub = hub();
        let sink = CollectSink::default();
        let ticket = hub.register("viewer", Box::new(sink.clone())).unwrap();

        assert!(hub.unregister(ticket.id));
        assert!(!hub.unregister(ticket.id));
        settle().await;
        assert_eq!(*sink.closed_with.lock(), Some(EvictReason::Disconnected));
    }

    #[tokio::test]
    async fn test_pacing_publishes_latest_and_closes_on_shutdown() {
        let hub = hub();
        let sink = CollectSink::default();
        hub.register("viewer", Box::new(sink.clone())).unwrap();

        let buffer = Arc::new(FrameBuffer::new(FrameBufferConfig::default()));
        buffer.push(frame(1));
        buffer.push(frame(2));
        let tuning = Arc::new(PipelineTuning::new(70));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(Arc::clone(&hub).run_pacing(buffer, tuning, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.cancel();
        task.await.unwrap();
        settle().await;

        // Only the newest frame is ever delivered, once.
        assert_eq!(*sink.frames.lock(), vec![2]);
        assert_eq!(hub.viewer_count(), 0);
        assert_eq!(*sink.closed_with.lock(), Some(EvictReason::Shutdown));
    }
}
