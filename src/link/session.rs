//! Device session loop
//!
//! Drives one device websocket from handshake to teardown:
//!
//! ```text
//! accept ──> Authenticating ──authenticate{token}──> Active ──┐
//!               │ bad/missing token                           │ select! {
//!               └─> auth_result{rejected} + close(1008)       │   shutdown, superseded,
//!                                                             │   inbound (in order),
//!                                                             │   outbound queue,
//!                                                             │   heartbeat deadline }
//!                                                             └──> Closed, unregister
//! ```
//!
//! Inbound messages are handled one at a time in arrival order; the
//! handler is awaited before the next message is read.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::device::{DeviceLink, Outbound};
use super::error::LinkError;
use super::heartbeat::{Heartbeat, HeartbeatAction, HeartbeatConfig};
use super::protocol::ControlMessage;
use super::registry::LinkRegistry;
use super::state::{CloseReason, DeviceRole};
use crate::events::{EventCategory, EventSink, Severity};
use crate::security::DeviceCredentials;
use crate::status::StatusBoard;
use crate::utils::RetryPolicy;

/// Device link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Deadline for the authenticate message (milliseconds)
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,

    /// Deadline for one websocket write (milliseconds)
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Outbound queue depth per link
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Errors tolerated before a link is marked degraded
    #[serde(default = "default_degrade_threshold")]
    pub degrade_threshold: u32,

    /// Largest accepted text message (bytes)
    #[serde(default = "default_max_text_bytes")]
    pub max_text_bytes: usize,

    /// Largest accepted websocket message of any kind (bytes)
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Recent errors kept per role
    #[serde(default = "default_recent_errors")]
    pub recent_errors: usize,

    /// Control-message write retries
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Liveness probing
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

fn default_auth_timeout_ms() -> u64 {
    5000
}
fn default_send_timeout_ms() -> u64 {
    5000
}
fn default_outbound_capacity() -> usize {
    64
}
fn default_degrade_threshold() -> u32 {
    10
}
fn default_max_text_bytes() -> usize {
    64 * 1024
}
fn default_max_message_bytes() -> usize {
    4 * 1024 * 1024
}
fn default_recent_errors() -> usize {
    20
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            auth_timeout_ms: default_auth_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            outbound_capacity: default_outbound_capacity(),
            degrade_threshold: default_degrade_threshold(),
            max_text_bytes: default_max_text_bytes(),
            max_message_bytes: default_max_message_bytes(),
            recent_errors: default_recent_errors(),
            retry: RetryPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Handshake deadline
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    /// Per-write deadline
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Receives inbound traffic of an authenticated device link
#[async_trait]
pub trait LinkHandler: Send + Sync {
    /// Control message other than authenticate/ping/pong
    async fn on_control(&self, link: &Arc<DeviceLink>, message: ControlMessage);

    /// Binary payload
    async fn on_binary(&self, link: &Arc<DeviceLink>, payload: Bytes);

    /// Link finished; called once after teardown
    async fn on_closed(&self, _link: &Arc<DeviceLink>, _reason: &CloseReason) {}
}

/// Services a device session needs
pub struct DeviceSessionContext {
    /// Authoritative link per role
    pub registry: Arc<LinkRegistry>,
    /// Accepted role tokens
    pub credentials: Arc<DeviceCredentials>,
    /// Role status
    pub status: Arc<StatusBoard>,
    /// Event sink
    pub events: Arc<dyn EventSink>,
    /// Inbound traffic handler
    pub handler: Arc<dyn LinkHandler>,
    /// Link settings
    pub config: LinkConfig,
    /// Process-wide shutdown
    pub shutdown: CancellationToken,
}

/// Event category for a role
pub fn role_category(role: DeviceRole) -> EventCategory {
    match role {
        DeviceRole::Camera => EventCategory::Camera,
        DeviceRole::Controller => EventCategory::Controller,
    }
}

/// Wait for `{"type":"authenticate"}` and return its token
pub(crate) async fn await_credential<St>(
    stream: &mut St,
    deadline: Duration,
    max_text_bytes: usize,
) -> Result<String, LinkError>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let wait = async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return match ControlMessage::parse(&text, max_text_bytes) {
                        Ok(ControlMessage::Authenticate { token }) => Ok(token),
                        Ok(other) => Err(LinkError::AuthRejected(format!(
                            "expected authenticate, got {}",
                            other.kind()
                        ))),
                        Err(e) => Err(LinkError::AuthRejected(e.to_string())),
                    };
                }
                Some(Ok(Message::Binary(_))) => {
                    return Err(LinkError::AuthRejected(
                        "data before authentication".to_string(),
                    ))
                }
                Some(Ok(Message::Close(_))) | None => return Err(LinkError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(LinkError::from(e)),
            }
        }
    };
    tokio::time::timeout(deadline, wait)
        .await
        .map_err(|_| LinkError::AuthTimeout)?
}

/// Write one message under a deadline
pub(crate) async fn write_message<Si>(
    sink: &mut Si,
    message: Message,
    deadline: Duration,
) -> Result<(), LinkError>
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    match tokio::time::timeout(deadline, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(LinkError::from(e)),
        Err(_) => Err(LinkError::SendTimeout(deadline)),
    }
}

/// Write a control message, retrying timeouts per `policy`
pub(crate) async fn write_control<Si>(
    sink: &mut Si,
    message: &ControlMessage,
    deadline: Duration,
    policy: &RetryPolicy,
) -> Result<(), LinkError>
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    let mut attempt = 0;
    loop {
        match write_message(sink, Message::Text(message.to_json()), deadline).await {
            Ok(()) => return Ok(()),
            Err(e) => match policy.next_delay(attempt, &e) {
                Some(delay) => {
                    debug!("Retrying {} write in {:?}: {}", message.kind(), delay, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(e),
            },
        }
    }
}

/// Best-effort close frame
pub(crate) async fn send_close<Si>(sink: &mut Si, code: CloseCode, reason: &str, deadline: Duration)
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = write_message(sink, Message::Close(Some(frame)), deadline).await;
    let _ = tokio::time::timeout(deadline, sink.close()).await;
}

/// Run a device session to completion, returning why it ended
pub async fn run_device_session<S>(
    ws: WebSocketStream<S>,
    role: DeviceRole,
    peer: String,
    ctx: &DeviceSessionContext,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let config = &ctx.config;
    let (link, mut outbound_rx) = DeviceLink::new(
        role,
        peer.clone(),
        Arc::clone(&ctx.status),
        config.outbound_capacity,
        config.degrade_threshold,
    );
    let (mut sink, mut stream) = ws.split();

    if let Err(e) = link.begin_authentication() {
        warn!("{} link {} could not start handshake: {}", role, link.id(), e);
    }

    // Handshake: one attempt, no retry window.
    let token = match await_credential(&mut stream, config.auth_timeout(), config.max_text_bytes).await {
        Ok(token) => token,
        Err(e) => return reject(&link, &mut sink, e, &peer, ctx).await,
    };
    if !ctx.credentials.accepts(role, &token) {
        let e = LinkError::AuthRejected("invalid token".to_string());
        return reject(&link, &mut sink, e, &peer, ctx).await;
    }

    if let Err(e) = ctx.registry.activate(Arc::clone(&link)) {
        warn!("{} link {} activation failed: {}", role, link.id(), e);
        link.close(CloseReason::TransportError(e.to_string()));
        return CloseReason::TransportError(e.to_string());
    }
    ctx.events.emit_event(
        &format!("{} connected from {}", role, peer),
        role_category(role),
        Severity::Info,
    );

    let ack = ControlMessage::ack(format!("{} link established", role));
    if let Err(e) = write_control(&mut sink, &ack, config.send_timeout(), &config.retry).await {
        link.record_error(&e.to_string());
    }

    let mut heartbeat = Heartbeat::new(config.heartbeat.clone(), Instant::now());
    let reason = loop {
        let deadline = match heartbeat.poll(Instant::now()) {
            HeartbeatAction::Expire => break CloseReason::InactivityTimeout,
            HeartbeatAction::Probe => {
                let probe = ControlMessage::Ping {
                    timestamp: Some(serde_json::json!(chrono::Utc::now().timestamp_millis())),
                };
                match write_message(&mut sink, Message::Text(probe.to_json()), config.send_timeout()).await {
                    Ok(()) => link.record_outbound(),
                    Err(e) => link.record_error(&format!("heartbeat probe: {}", e)),
                }
                heartbeat.on_probe_sent(Instant::now());
                continue;
            }
            HeartbeatAction::Wait { until } => until,
        };

        tokio::select! {
            biased;

            _ = ctx.shutdown.cancelled() => break CloseReason::Shutdown,

            _ = link.closed() => {
                break link.close_reason().unwrap_or(CloseReason::Superseded);
            }

            inbound = stream.next() => match inbound {
                None => break CloseReason::PeerClosed,
                Some(Err(e)) => break CloseReason::TransportError(e.to_string()),
                Some(Ok(Message::Close(_))) => break CloseReason::PeerClosed,
                Some(Ok(message)) => {
                    heartbeat.on_inbound(Instant::now());
                    link.record_inbound();
                    dispatch_inbound(&link, message, ctx).await;
                }
            },

            outbound = outbound_rx.recv() => {
                let Some(outbound) = outbound else {
                    break CloseReason::TransportError("outbound queue closed".to_string());
                };
                let message = match outbound {
                    Outbound::Control(control) => Message::Text(control.to_json()),
                    Outbound::Binary(data) => Message::Binary(data.to_vec()),
                };
                match write_message(&mut sink, message, config.send_timeout()).await {
                    Ok(()) => link.record_outbound(),
                    Err(LinkError::SendTimeout(d)) => {
                        link.record_error(&format!("send timed out after {:?}", d));
                    }
                    Err(e) => break CloseReason::TransportError(e.to_string()),
                }
            }

            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
        }
    };

    // Keeps the first reason if the link was already closed (supersession).
    link.close(reason.clone());
    let reason = link.close_reason().unwrap_or(reason);

    let code = match reason {
        CloseReason::Shutdown => CloseCode::Away,
        CloseReason::Superseded => CloseCode::Policy,
        _ => CloseCode::Normal,
    };
    if !matches!(reason, CloseReason::PeerClosed | CloseReason::TransportError(_)) {
        send_close(&mut sink, code, &reason.to_string(), config.send_timeout()).await;
    }

    ctx.registry.remove_if_current(role, link.id());
    let severity = match reason {
        CloseReason::Shutdown | CloseReason::Superseded => Severity::Info,
        _ => Severity::Warning,
    };
    ctx.events.emit_event(
        &format!("{} disconnected: {}", role, reason),
        role_category(role),
        severity,
    );
    ctx.handler.on_closed(&link, &reason).await;
    reason
}

async fn reject<Si>(
    link: &Arc<DeviceLink>,
    sink: &mut Si,
    error: LinkError,
    peer: &str,
    ctx: &DeviceSessionContext,
) -> CloseReason
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    let role = link.role();
    let reason = match &error {
        LinkError::AuthTimeout => CloseReason::AuthTimeout,
        LinkError::AuthRejected(why) => CloseReason::AuthRejected(why.clone()),
        LinkError::Closed => CloseReason::PeerClosed,
        other => CloseReason::TransportError(other.to_string()),
    };

    if matches!(reason, CloseReason::AuthRejected(_) | CloseReason::AuthTimeout) {
        let deadline = ctx.config.send_timeout();
        let notice = ControlMessage::rejected(reason.to_string());
        let _ = write_message(sink, Message::Text(notice.to_json()), deadline).await;
        send_close(sink, CloseCode::Policy, &reason.to_string(), deadline).await;
        ctx.events.emit_event(
            &format!("{} handshake from {} refused: {}", role, peer, error),
            EventCategory::Security,
            Severity::Warning,
        );
    } else {
        info!("{} connection from {} ended during handshake: {}", role, peer, error);
    }

    link.close(reason.clone());
    reason
}

async fn dispatch_inbound(link: &Arc<DeviceLink>, message: Message, ctx: &DeviceSessionContext) {
    match message {
        Message::Text(text) => match ControlMessage::parse(&text, ctx.config.max_text_bytes) {
            Ok(ControlMessage::Ping { timestamp }) => {
                link.send_control(ControlMessage::Pong { timestamp });
            }
            Ok(ControlMessage::Pong { .. }) => {}
            Ok(ControlMessage::Authenticate { .. }) => {
                link.record_error("authenticate on an established link");
            }
            Ok(control) => ctx.handler.on_control(link, control).await,
            Err(e) => {
                warn!("{} link {}: dropping message: {}", link.role(), link.id(), e);
                link.record_error(&e.to_string());
            }
        },
        Message::Binary(data) => ctx.handler.on_binary(link, Bytes::from(data)).await,
        // Transport-level ping/pong are answered by tungstenite.
        _ => {}
    }
}
