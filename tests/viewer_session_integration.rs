//! Viewer sessions against a live broadcast hub

mod common;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use common::{authenticate, close_code, expect_binary, expect_close, expect_control, send_control, ws_pair, Ws};
use vigil_server::broadcast::{run_viewer_session, BroadcastConfig, BroadcastHub, ViewerRequests, ViewerSessionContext};
use vigil_server::events::EventLog;
use vigil_server::frame::Frame;
use vigil_server::link::{CloseReason, ControlMessage, LinkConfig};
use vigil_server::security::{Principal, StaticTokenAuthorizer};

#[derive(Default)]
struct StubRequests {
    relayed: Mutex<Vec<(String, ControlMessage)>>,
    controller_online: bool,
}

impl ViewerRequests for StubRequests {
    fn status_report(&self) -> Value {
        json!({ "device_online": { "camera": true, "controller": self.controller_online } })
    }

    fn relay_command(&self, principal: &Principal, command: ControlMessage) -> bool {
        self.relayed.lock().push((principal.name.clone(), command));
        self.controller_online
    }
}

fn context(broadcast: BroadcastConfig, requests: Arc<StubRequests>) -> Arc<ViewerSessionContext> {
    Arc::new(ViewerSessionContext {
        hub: BroadcastHub::new(broadcast),
        authorizer: Arc::new(StaticTokenAuthorizer::new([("viewer-secret", "owner")])),
        requests,
        events: Arc::new(EventLog::new(64)),
        link: LinkConfig::default(),
        shutdown: CancellationToken::new(),
    })
}

fn spawn_session(server: Ws, ctx: &Arc<ViewerSessionContext>) -> JoinHandle<CloseReason> {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move { run_viewer_session(server, "viewer-peer".to_string(), &ctx).await })
}

async fn connect(ctx: &Arc<ViewerSessionContext>) -> (Ws, JoinHandle<CloseReason>) {
    let (server, mut client) = ws_pair().await;
    let session = spawn_session(server, ctx);
    authenticate(&mut client, "viewer-secret").await;
    expect_control(&mut client, "connection_ack").await;
    (client, session)
}

#[tokio::test]
async fn test_viewer_receives_live_frames() {
    let ctx = context(BroadcastConfig::default(), Arc::default());
    let (mut client, _session) = connect(&ctx).await;
    assert_eq!(ctx.hub.viewer_count(), 1);
    assert_eq!(ctx.hub.viewers()[0].principal, "owner");

    let frame = Arc::new(Frame::pass_through(Bytes::from_static(b"jpeg-bytes"), Utc::now(), 1));
    assert_eq!(ctx.hub.publish(frame), 1);
    assert_eq!(expect_binary(&mut client).await, b"jpeg-bytes".to_vec());
}

#[tokio::test]
async fn test_ping_and_status_requests() {
    let ctx = context(BroadcastConfig::default(), Arc::default());
    let (mut client, _session) = connect(&ctx).await;

    send_control(
        &mut client,
        &ControlMessage::Ping {
            timestamp: Some(json!("t1")),
        },
    )
    .await;
    assert_eq!(
        expect_control(&mut client, "pong").await,
        ControlMessage::Pong {
            timestamp: Some(json!("t1"))
        }
    );

    send_control(&mut client, &ControlMessage::Status { data: None }).await;
    match expect_control(&mut client, "status").await {
        ControlMessage::Status { data: Some(data) } => {
            assert_eq!(data["device_online"]["camera"], json!(true));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_servo_command_relayed() {
    let requests = Arc::new(StubRequests {
        controller_online: true,
        ..Default::default()
    });
    let ctx = context(BroadcastConfig::default(), Arc::clone(&requests));
    let (mut client, _session) = connect(&ctx).await;

    let command = ControlMessage::Servo {
        command: json!({"pan": 30}),
    };
    send_control(&mut client, &command).await;
    match expect_control(&mut client, "status").await {
        ControlMessage::Status { data: Some(data) } => {
            assert_eq!(data, json!({"command": "servo", "delivered": true}));
        }
        other => panic!("unexpected {:?}", other),
    }
    let relayed = requests.relayed.lock();
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0], ("owner".to_string(), command));
}

#[tokio::test]
async fn test_events_fan_out() {
    let ctx = context(BroadcastConfig::default(), Arc::default());
    let (mut first, _s1) = connect(&ctx).await;
    let (mut second, _s2) = connect(&ctx).await;

    let event = ControlMessage::Status {
        data: Some(json!({"role": "camera", "online": false})),
    };
    assert_eq!(ctx.hub.publish_event(&event.to_json()), 2);
    assert_eq!(expect_control(&mut first, "status").await, event);
    assert_eq!(expect_control(&mut second, "status").await, event);
}

#[tokio::test]
async fn test_invalid_token_refused() {
    let ctx = context(BroadcastConfig::default(), Arc::default());
    let (server, mut client) = ws_pair().await;
    let session = spawn_session(server, &ctx);

    authenticate(&mut client, "guess").await;
    match expect_control(&mut client, "auth_result").await {
        ControlMessage::AuthResult { status, .. } => assert_eq!(status, "rejected"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(close_code(&expect_close(&mut client).await), Some(1008));
    assert!(matches!(session.await.unwrap(), CloseReason::AuthRejected(_)));
    assert_eq!(ctx.hub.viewer_count(), 0);
}

#[tokio::test]
async fn test_viewer_limit_enforced() {
    let ctx = context(
        BroadcastConfig {
            max_viewers: 1,
            ..Default::default()
        },
        Arc::default(),
    );
    let (_first, _s1) = connect(&ctx).await;

    let (server, mut client) = ws_pair().await;
    let session = spawn_session(server, &ctx);
    authenticate(&mut client, "viewer-secret").await;
    expect_control(&mut client, "auth_result").await;
    assert_eq!(close_code(&expect_close(&mut client).await), Some(1013));
    assert!(matches!(session.await.unwrap(), CloseReason::AuthRejected(_)));
    assert_eq!(ctx.hub.viewer_count(), 1);
}

#[tokio::test]
async fn test_disconnect_unregisters_viewer() {
    let ctx = context(BroadcastConfig::default(), Arc::default());
    let (mut client, session) = connect(&ctx).await;

    client.close(None).await.unwrap();
    assert_eq!(session.await.unwrap(), CloseReason::PeerClosed);
    assert_eq!(ctx.hub.viewer_count(), 0);
}

#[tokio::test]
async fn test_shutdown_closes_viewers() {
    let ctx = context(BroadcastConfig::default(), Arc::default());
    let (mut client, session) = connect(&ctx).await;

    ctx.shutdown.cancel();
    assert_eq!(session.await.unwrap(), CloseReason::Shutdown);
    assert_eq!(close_code(&expect_close(&mut client).await), Some(1001));
    assert_eq!(ctx.hub.viewer_count(), 0);
}
