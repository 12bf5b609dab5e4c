//! Device link
//!
//! Stateful handle for one peripheral connection. The session loop
//! ([`run_device_session`](super::run_device_session)) owns the socket;
//! everything else talks to the peer through this handle:
//!
//! - [`DeviceLink::send`] queues an outbound message without waiting and
//!   reports success as a `bool`. Failures bump the error counter.
//! - [`DeviceLink::close`] records the reason and wakes the session loop,
//!   which tears the socket down.
//!
//! Every state transition is published to the [`StatusBoard`].

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::LinkError;
use super::protocol::ControlMessage;
use super::state::{CloseReason, DeviceRole, LinkState, LinkStateMachine};
use crate::status::StatusBoard;

/// Message queued for the peer
#[derive(Debug, Clone)]
pub enum Outbound {
    /// JSON control message
    Control(ControlMessage),
    /// Raw binary payload
    Binary(Bytes),
}

/// Point-in-time view of a link
#[derive(Debug, Clone, Serialize)]
pub struct LinkInfo {
    /// Link id
    pub id: Uuid,
    /// Peripheral role
    pub role: DeviceRole,
    /// Remote address
    pub peer: String,
    /// Current state
    pub state: LinkState,
    /// Last inbound message
    pub last_seen_at: DateTime<Utc>,
    /// Last inbound or outbound success
    pub last_activity_at: DateTime<Utc>,
    /// Errors since the link last recovered
    pub error_count: u32,
    /// Messages queued but not yet written
    pub outbound_queue_depth: usize,
}

struct Timestamps {
    last_seen_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
}

/// One peripheral connection
pub struct DeviceLink {
    id: Uuid,
    role: DeviceRole,
    peer: String,
    machine: Mutex<LinkStateMachine>,
    timestamps: Mutex<Timestamps>,
    close_reason: Mutex<Option<CloseReason>>,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    status: Arc<StatusBoard>,
}

impl DeviceLink {
    /// Create a link in `Connecting`, returning the outbound queue receiver
    pub fn new(
        role: DeviceRole,
        peer: impl Into<String>,
        status: Arc<StatusBoard>,
        outbound_capacity: usize,
        degrade_threshold: u32,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(outbound_capacity.max(1));
        let now = Utc::now();
        let link = Arc::new(Self {
            id: Uuid::new_v4(),
            role,
            peer: peer.into(),
            machine: Mutex::new(LinkStateMachine::new(degrade_threshold)),
            timestamps: Mutex::new(Timestamps {
                last_seen_at: now,
                last_activity_at: now,
            }),
            close_reason: Mutex::new(None),
            outbound: tx,
            cancel: CancellationToken::new(),
            status,
        });
        (link, rx)
    }

    /// Link id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Peripheral role
    pub fn role(&self) -> DeviceRole {
        self.role
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        self.machine.lock().state()
    }

    /// Reason recorded by the first `close`
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Resolves once the link has been closed
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// True once the link has been closed
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn transition(&self, next: LinkState) -> Result<LinkState, LinkError> {
        let previous = self.machine.lock().transition(next)?;
        self.status.record_transition(self.role, self.id, next);
        Ok(previous)
    }

    /// Transport accepted, waiting for the credential
    pub fn begin_authentication(&self) -> Result<(), LinkError> {
        self.transition(LinkState::Authenticating).map(|_| ())
    }

    /// Credential accepted
    pub fn activate(&self) -> Result<(), LinkError> {
        self.transition(LinkState::Active)?;
        info!("{} link {} active ({})", self.role, self.id, self.peer);
        Ok(())
    }

    /// Queue a message for the peer; `false` when it could not be queued
    pub fn send(&self, message: Outbound) -> bool {
        if self.is_closed() {
            self.record_error("send on closed link");
            return false;
        }
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.record_error("outbound queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.record_error("outbound queue closed");
                false
            }
        }
    }

    /// Queue a control message
    pub fn send_control(&self, message: ControlMessage) -> bool {
        self.send(Outbound::Control(message))
    }

    /// Note an inbound message
    pub fn record_inbound(&self) {
        let now = Utc::now();
        {
            let mut ts = self.timestamps.lock();
            ts.last_seen_at = now;
            ts.last_activity_at = now;
        }
        self.status.record_seen(self.role, self.id);
        self.record_success();
    }

    /// Note a completed outbound write
    pub fn record_outbound(&self) {
        self.timestamps.lock().last_activity_at = Utc::now();
        self.record_success();
    }

    fn record_success(&self) {
        let recovered = self.machine.lock().record_success();
        if recovered.is_some() {
            self.status
                .record_transition(self.role, self.id, LinkState::Active);
            info!("{} link {} recovered", self.role, self.id);
        }
    }

    /// Count an error (malformed payload, failed send)
    pub fn record_error(&self, reason: &str) {
        let degraded = self.machine.lock().record_error();
        debug!("{} link {} error: {}", self.role, self.id, reason);
        self.status.record_error(self.role, reason);
        if degraded.is_some() {
            self.status
                .record_transition(self.role, self.id, LinkState::Degraded);
            warn!(
                "{} link {} degraded after repeated errors (last: {})",
                self.role, self.id, reason
            );
        }
    }

    /// Close the link; only the first reason is kept
    pub fn close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.clone());
        }
        if self.transition(LinkState::Closed).is_ok() {
            info!("{} link {} closed: {}", self.role, self.id, reason);
        }
        self.cancel.cancel();
    }

    /// Snapshot for status queries
    pub fn info(&self) -> LinkInfo {
        let (state, error_count) = {
            let machine = self.machine.lock();
            (machine.state(), machine.error_count())
        };
        let (last_seen_at, last_activity_at) = {
            let ts = self.timestamps.lock();
            (ts.last_seen_at, ts.last_activity_at)
        };
        LinkInfo {
            id: self.id,
            role: self.role,
            peer: self.peer.clone(),
            state,
            last_seen_at,
            last_activity_at,
            error_count,
            outbound_queue_depth: self.outbound.max_capacity() - self.outbound.capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_link(capacity: usize) -> (Arc<DeviceLink>, mpsc::Receiver<Outbound>, Arc<StatusBoard>) {
        let status = Arc::new(StatusBoard::new(10));
        let (link, rx) = DeviceLink::new(DeviceRole::Camera, "127.0.0.1:9", Arc::clone(&status), capacity, 2);
        link.begin_authentication().unwrap();
        link.activate().unwrap();
        (link, rx, status)
    }

    #[test]
    fn test_send_queues_until_full() {
        let (link, mut rx, _) = active_link(2);
        assert!(link.send_control(ControlMessage::Ping { timestamp: None }));
        assert!(link.send(Outbound::Binary(Bytes::from_static(b"x"))));
        assert_eq!(link.info().outbound_queue_depth, 2);

        assert!(!link.send_control(ControlMessage::Ping { timestamp: None }));
        assert_eq!(link.info().error_count, 1);

        assert!(matches!(rx.try_recv(), Ok(Outbound::Control(_))));
        assert_eq!(link.info().outbound_queue_depth, 1);
    }

    #[test]
    fn test_degrades_then_recovers() {
        let (link, _rx, status) = active_link(1);
        for _ in 0..3 {
            link.record_error("bad payload");
        }
        assert_eq!(link.state(), LinkState::Degraded);
        assert!(status.is_online(DeviceRole::Camera));
        assert_eq!(status.role(DeviceRole::Camera).recent_errors.len(), 3);
        assert_eq!(status.role(DeviceRole::Camera).state, LinkState::Degraded);

        link.record_inbound();
        assert_eq!(link.state(), LinkState::Active);
        assert_eq!(status.role(DeviceRole::Camera).state, LinkState::Active);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (link, _rx, status) = active_link(1);
        link.close(CloseReason::InactivityTimeout);
        link.close(CloseReason::Shutdown);

        assert!(link.is_closed());
        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(link.close_reason(), Some(CloseReason::InactivityTimeout));
        assert!(!status.is_online(DeviceRole::Camera));
    }

    #[test]
    fn test_send_after_close_fails() {
        let (link, _rx, _) = active_link(4);
        link.close(CloseReason::PeerClosed);
        assert!(!link.send_control(ControlMessage::Ping { timestamp: None }));
    }

    #[tokio::test]
    async fn test_closed_future_resolves() {
        let (link, _rx, _) = active_link(1);
        let waiter = Arc::clone(&link);
        let handle = tokio::spawn(async move { waiter.closed().await });
        link.close(CloseReason::Superseded);
        handle.await.unwrap();
    }
}
