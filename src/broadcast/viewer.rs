//! Viewer sinks and the viewer session loop
//!
//! A viewer websocket is split in two: the write half becomes a
//! [`WsViewerSink`] owned by the hub's writer task, the read half stays
//! here and serves requests (`ping`, `status`, `servo`, `action`). Replies
//! go back through the hub's event mailbox so the writer remains the only
//! task touching the write half.

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::hub::{BroadcastHub, EvictReason};
use super::BroadcastError;
use crate::events::{EventCategory, EventSink, Severity};
use crate::frame::Frame;
use crate::link::{await_credential, send_close, write_message, CloseReason, ControlMessage, LinkConfig, LinkError};
use crate::security::{Authorizer, Principal};

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Write half of one viewer connection
#[async_trait]
pub trait ViewerSink: Send {
    /// Write one encoded frame
    async fn send_frame(&mut self, frame: &Frame) -> Result<(), BroadcastError>;

    /// Write one JSON text message
    async fn send_text(&mut self, text: &str) -> Result<(), BroadcastError>;

    /// Best-effort close
    async fn close(&mut self, reason: EvictReason);
}

/// [`ViewerSink`] over the write half of a websocket
pub struct WsViewerSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    close_timeout: Duration,
}

impl<S> WsViewerSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a websocket write half
    pub fn new(sink: SplitSink<WebSocketStream<S>, Message>, close_timeout: Duration) -> Self {
        Self { sink, close_timeout }
    }
}

fn send_error(e: WsError) -> BroadcastError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => BroadcastError::Closed,
        other => BroadcastError::Send(other.to_string()),
    }
}

#[async_trait]
impl<S> ViewerSink for WsViewerSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: &Frame) -> Result<(), BroadcastError> {
        self.sink
            .send(Message::Binary(frame.payload.to_vec()))
            .await
            .map_err(send_error)
    }

    async fn send_text(&mut self, text: &str) -> Result<(), BroadcastError> {
        self.sink
            .send(Message::Text(text.to_string()))
            .await
            .map_err(send_error)
    }

    async fn close(&mut self, reason: EvictReason) {
        let code = match reason {
            EvictReason::SendFailures => CloseCode::Again,
            EvictReason::Shutdown => CloseCode::Away,
            EvictReason::Disconnected => CloseCode::Normal,
        };
        send_close(&mut self.sink, code, &reason.to_string(), self.close_timeout).await;
    }
}

/// Requests a viewer may make of the rest of the appliance
pub trait ViewerRequests: Send + Sync {
    /// Current system status as JSON
    fn status_report(&self) -> Value;

    /// Forward a `servo`/`action` command to the controller
    fn relay_command(&self, principal: &Principal, command: ControlMessage) -> bool;
}

/// Shared collaborators for viewer sessions
pub struct ViewerSessionContext {
    /// Frame and event fan-out
    pub hub: Arc<BroadcastHub>,
    /// Viewer token check
    pub authorizer: Arc<dyn Authorizer>,
    /// Status and command relay
    pub requests: Arc<dyn ViewerRequests>,
    /// Event sink
    pub events: Arc<dyn EventSink>,
    /// Handshake and message limits
    pub link: LinkConfig,
    /// Process-wide shutdown
    pub shutdown: CancellationToken,
}

/// Fixed one-minute window of inbound messages
#[derive(Debug)]
struct RateWindow {
    limit: u32,
    started: Instant,
    count: u32,
}

impl RateWindow {
    fn new(limit: u32, now: Instant) -> Self {
        Self {
            limit,
            started: now,
            count: 0,
        }
    }

    fn allow(&mut self, now: Instant) -> bool {
        if self.limit == 0 {
            return true;
        }
        if now.duration_since(self.started) >= RATE_WINDOW {
            self.started = now;
            self.count = 0;
        }
        if self.count >= self.limit {
            return false;
        }
        self.count += 1;
        true
    }
}

/// Run a viewer session to completion, returning why it ended
pub async fn run_viewer_session<S>(ws: WebSocketStream<S>, peer: String, ctx: &ViewerSessionContext) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();

    let token = match await_credential(&mut stream, ctx.link.auth_timeout(), ctx.link.max_text_bytes).await {
        Ok(token) => token,
        Err(e) => return refuse(&mut sink, e, &peer, ctx).await,
    };
    let Some(principal) = ctx.authorizer.is_authorized(&token) else {
        let e = LinkError::AuthRejected("invalid token".to_string());
        return refuse(&mut sink, e, &peer, ctx).await;
    };

    let max_viewers = ctx.hub.config().max_viewers;
    if ctx.hub.viewer_count() >= max_viewers {
        let e = BroadcastError::TooManyViewers(max_viewers);
        let deadline = ctx.link.send_timeout();
        let notice = ControlMessage::rejected(e.to_string());
        let _ = write_message(&mut sink, Message::Text(notice.to_json()), deadline).await;
        send_close(&mut sink, CloseCode::Again, &e.to_string(), deadline).await;
        warn!("Viewer {} from {} refused: {}", principal.name, peer, e);
        return CloseReason::AuthRejected(e.to_string());
    }

    let ticket = match ctx
        .hub
        .register(principal.name.clone(), Box::new(WsViewerSink::new(sink, ctx.link.send_timeout())))
    {
        Ok(ticket) => ticket,
        Err(e) => {
            // Lost a race for the last slot; the dropped sink closes the socket.
            warn!("Viewer {} from {} refused: {}", principal.name, peer, e);
            return CloseReason::AuthRejected(e.to_string());
        }
    };
    let id = ticket.id;
    ctx.hub
        .send_to(id, &ControlMessage::ack(format!("viewer {} connected", principal.name)).to_json());
    ctx.events.emit_event(
        &format!("Viewer {} connected from {}", principal.name, peer),
        EventCategory::Broadcast,
        Severity::Info,
    );

    let config = ctx.hub.config();
    let inactivity = config.viewer_inactivity();
    let mut last_inbound = Instant::now();
    let mut window = RateWindow::new(config.rate_limit_per_minute, last_inbound);

    let reason = loop {
        tokio::select! {
            biased;

            _ = ctx.shutdown.cancelled() => break CloseReason::Shutdown,

            _ = ticket.closed.cancelled() => {
                break CloseReason::TransportError("removed from broadcast".to_string());
            }

            inbound = stream.next() => match inbound {
                None | Some(Ok(Message::Close(_))) => break CloseReason::PeerClosed,
                Some(Err(e)) => break CloseReason::TransportError(e.to_string()),
                Some(Ok(Message::Text(text))) => {
                    let now = Instant::now();
                    last_inbound = now;
                    if !window.allow(now) {
                        warn!("Viewer {} over {} messages/min, dropping message", id, window.limit);
                        continue;
                    }
                    handle_request(id, &principal, &text, ctx);
                }
                Some(Ok(_)) => last_inbound = Instant::now(),
            },

            _ = tokio::time::sleep_until(last_inbound + inactivity) => break CloseReason::InactivityTimeout,
        }
    };

    match reason {
        CloseReason::Shutdown => ctx.hub.evict(id, EvictReason::Shutdown),
        _ => ctx.hub.unregister(id),
    };
    info!("Viewer {} ({}) session ended: {}", id, principal.name, reason);
    reason
}

fn handle_request(id: Uuid, principal: &Principal, text: &str, ctx: &ViewerSessionContext) {
    let message = match ControlMessage::parse(text, ctx.link.max_text_bytes) {
        Ok(message) => message,
        Err(e) => {
            warn!("Viewer {}: dropping message: {}", id, e);
            return;
        }
    };

    match message {
        ControlMessage::Ping { timestamp } => {
            ctx.hub.send_to(id, &ControlMessage::Pong { timestamp }.to_json());
        }
        ControlMessage::Pong { .. } => {}
        ControlMessage::Status { .. } => {
            let report = ControlMessage::Status {
                data: Some(ctx.requests.status_report()),
            };
            ctx.hub.send_to(id, &report.to_json());
        }
        command @ (ControlMessage::Servo { .. } | ControlMessage::Action { .. }) => {
            let kind = command.kind();
            let delivered = ctx.requests.relay_command(principal, command);
            if !delivered {
                debug!("Viewer {} {} command not delivered", id, kind);
            }
            let reply = ControlMessage::Status {
                data: Some(json!({ "command": kind, "delivered": delivered })),
            };
            ctx.hub.send_to(id, &reply.to_json());
        }
        other => debug!("Viewer {} sent unsupported {}", id, other.kind()),
    }
}

async fn refuse<Si>(sink: &mut Si, error: LinkError, peer: &str, ctx: &ViewerSessionContext) -> CloseReason
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    let reason = match &error {
        LinkError::AuthTimeout => CloseReason::AuthTimeout,
        LinkError::AuthRejected(why) => CloseReason::AuthRejected(why.clone()),
        LinkError::Closed => return CloseReason::PeerClosed,
        other => return CloseReason::TransportError(other.to_string()),
    };

    let deadline = ctx.link.send_timeout();
    let notice = ControlMessage::rejected(reason.to_string());
    let _ = write_message(sink, Message::Text(notice.to_json()), deadline).await;
    send_close(sink, CloseCode::Policy, &reason.to_string(), deadline).await;
    ctx.events.emit_event(
        &format!("Viewer handshake from {} refused: {}", peer, error),
        EventCategory::Security,
        Severity::Warning,
    );
    reason
}
