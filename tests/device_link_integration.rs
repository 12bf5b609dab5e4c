//! Device link sessions driven over in-memory websockets

mod common;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::SinkExt;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use common::{authenticate, close_code, expect_close, expect_control, send_control, ws_pair, Ws};
use vigil_server::events::EventLog;
use vigil_server::link::{
    run_device_session, CloseReason, ControlMessage, DeviceLink, DeviceRole, DeviceSessionContext, LinkConfig,
    LinkHandler, LinkRegistry,
};
use vigil_server::security::DeviceCredentials;
use vigil_server::status::StatusBoard;

struct Collect {
    payloads: mpsc::UnboundedSender<Bytes>,
    controls: mpsc::UnboundedSender<ControlMessage>,
}

#[async_trait]
impl LinkHandler for Collect {
    async fn on_control(&self, _link: &Arc<DeviceLink>, message: ControlMessage) {
        let _ = self.controls.send(message);
    }

    async fn on_binary(&self, _link: &Arc<DeviceLink>, payload: Bytes) {
        let _ = self.payloads.send(payload);
    }
}

struct Harness {
    ctx: Arc<DeviceSessionContext>,
    payloads: mpsc::UnboundedReceiver<Bytes>,
    controls: mpsc::UnboundedReceiver<ControlMessage>,
    events: Arc<EventLog>,
}

fn harness(config: LinkConfig) -> Harness {
    let (payload_tx, payloads) = mpsc::unbounded_channel();
    let (control_tx, controls) = mpsc::unbounded_channel();
    let events = Arc::new(EventLog::new(64));
    let ctx = DeviceSessionContext {
        registry: Arc::new(LinkRegistry::new()),
        credentials: Arc::new(DeviceCredentials::new(
            &["camera-secret".to_string()],
            &["controller-secret".to_string()],
        )),
        status: Arc::new(StatusBoard::new(8)),
        events: events.clone(),
        handler: Arc::new(Collect {
            payloads: payload_tx,
            controls: control_tx,
        }),
        config,
        shutdown: CancellationToken::new(),
    };
    Harness {
        ctx: Arc::new(ctx),
        payloads,
        controls,
        events,
    }
}

fn spawn_session(server: Ws, role: DeviceRole, ctx: &Arc<DeviceSessionContext>) -> JoinHandle<CloseReason> {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move { run_device_session(server, role, "test-peer".to_string(), &ctx).await })
}

async fn connect(role: DeviceRole, token: &str, ctx: &Arc<DeviceSessionContext>) -> (Ws, JoinHandle<CloseReason>) {
    let (server, mut client) = ws_pair().await;
    let session = spawn_session(server, role, ctx);
    authenticate(&mut client, token).await;
    expect_control(&mut client, "connection_ack").await;
    (client, session)
}

#[tokio::test]
async fn test_camera_streams_frames() {
    let mut h = harness(LinkConfig::default());
    let (mut client, session) = connect(DeviceRole::Camera, "camera-secret", &h.ctx).await;

    assert!(h.ctx.registry.get(DeviceRole::Camera).is_some());
    assert!(h.ctx.status.is_online(DeviceRole::Camera));

    for i in 0..3u8 {
        client.send(Message::Binary(vec![i; 16])).await.unwrap();
    }
    for i in 0..3u8 {
        assert_eq!(h.payloads.recv().await.unwrap(), Bytes::from(vec![i; 16]));
    }

    client.close(None).await.unwrap();
    assert_eq!(session.await.unwrap(), CloseReason::PeerClosed);
    assert!(h.ctx.registry.get(DeviceRole::Camera).is_none());
    assert!(!h.ctx.status.is_online(DeviceRole::Camera));
}

#[tokio::test]
async fn test_ping_answered_with_matching_pong() {
    let h = harness(LinkConfig::default());
    let (mut client, _session) = connect(DeviceRole::Controller, "controller-secret", &h.ctx).await;

    send_control(
        &mut client,
        &ControlMessage::Ping {
            timestamp: Some(json!(42)),
        },
    )
    .await;
    let pong = expect_control(&mut client, "pong").await;
    assert_eq!(
        pong,
        ControlMessage::Pong {
            timestamp: Some(json!(42))
        }
    );
}

#[tokio::test]
async fn test_control_messages_reach_handler() {
    let mut h = harness(LinkConfig::default());
    let (mut client, _session) = connect(DeviceRole::Controller, "controller-secret", &h.ctx).await;

    let log = ControlMessage::Log {
        message: "servo calibrated".to_string(),
        level: "info".to_string(),
    };
    send_control(&mut client, &log).await;
    assert_eq!(h.controls.recv().await.unwrap(), log);
}

#[tokio::test]
async fn test_malformed_message_keeps_link() {
    let h = harness(LinkConfig::default());
    let (mut client, _session) = connect(DeviceRole::Controller, "controller-secret", &h.ctx).await;

    client.send(Message::Text("not json".to_string())).await.unwrap();
    client
        .send(Message::Text(r#"{"type":"teleport"}"#.to_string()))
        .await
        .unwrap();
    send_control(&mut client, &ControlMessage::Ping { timestamp: None }).await;
    expect_control(&mut client, "pong").await;

    let status = h.ctx.status.role(DeviceRole::Controller);
    assert!(status.online);
    assert_eq!(status.recent_errors.len(), 2);
}

#[tokio::test]
async fn test_commands_forwarded_to_controller() {
    let h = harness(LinkConfig::default());
    let (mut client, _session) = connect(DeviceRole::Controller, "controller-secret", &h.ctx).await;

    let command = ControlMessage::Servo {
        command: json!({"pan": -15, "tilt": 5}),
    };
    assert!(h.ctx.registry.send_to(DeviceRole::Controller, command.clone()));
    assert_eq!(expect_control(&mut client, "servo").await, command);
}

#[tokio::test]
async fn test_wrong_token_rejected() {
    let h = harness(LinkConfig::default());
    let (server, mut client) = ws_pair().await;
    let session = spawn_session(server, DeviceRole::Camera, &h.ctx);

    // A controller token is not a camera token.
    authenticate(&mut client, "controller-secret").await;
    match expect_control(&mut client, "auth_result").await {
        ControlMessage::AuthResult { status, reason } => {
            assert_eq!(status, "rejected");
            assert!(reason.is_some());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(close_code(&expect_close(&mut client).await), Some(1008));

    assert!(matches!(session.await.unwrap(), CloseReason::AuthRejected(_)));
    assert!(h.ctx.registry.get(DeviceRole::Camera).is_none());
    assert!(!h.events.is_empty());
}

#[tokio::test]
async fn test_binary_before_authentication_rejected() {
    let h = harness(LinkConfig::default());
    let (server, mut client) = ws_pair().await;
    let session = spawn_session(server, DeviceRole::Camera, &h.ctx);

    client.send(Message::Binary(vec![0xff; 8])).await.unwrap();
    expect_control(&mut client, "auth_result").await;
    assert!(matches!(session.await.unwrap(), CloseReason::AuthRejected(_)));
}

#[tokio::test]
async fn test_silent_peer_times_out_in_handshake() {
    let h = harness(LinkConfig {
        auth_timeout_ms: 100,
        ..Default::default()
    });
    let (server, mut client) = ws_pair().await;
    let session = spawn_session(server, DeviceRole::Camera, &h.ctx);

    expect_control(&mut client, "auth_result").await;
    assert_eq!(session.await.unwrap(), CloseReason::AuthTimeout);
}

#[tokio::test]
async fn test_reconnect_supersedes_previous_link() {
    let h = harness(LinkConfig::default());
    let (mut first, first_session) = connect(DeviceRole::Camera, "camera-secret", &h.ctx).await;
    let first_id = h.ctx.registry.get(DeviceRole::Camera).unwrap().id();

    let (mut second, second_session) = connect(DeviceRole::Camera, "camera-secret", &h.ctx).await;

    assert_eq!(close_code(&expect_close(&mut first).await), Some(1008));
    assert_eq!(first_session.await.unwrap(), CloseReason::Superseded);

    // The old link's teardown must not unregister or offline the new one.
    let current = h.ctx.registry.get(DeviceRole::Camera).unwrap();
    assert_ne!(current.id(), first_id);
    assert!(h.ctx.status.is_online(DeviceRole::Camera));

    h.ctx.shutdown.cancel();
    assert_eq!(close_code(&expect_close(&mut second).await), Some(1001));
    assert_eq!(second_session.await.unwrap(), CloseReason::Shutdown);
}
