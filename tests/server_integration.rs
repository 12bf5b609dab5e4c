//! Whole-appliance test over real TCP sockets

mod common;

use futures_util::SinkExt;
use image::{Rgb, RgbImage};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use common::{authenticate, close_code, expect_binary, expect_close, expect_control, send_control};
use vigil_server::config::{Config, ViewerToken};
use vigil_server::link::ControlMessage;
use vigil_server::recording::JsonIndexCatalog;
use vigil_server::server::VigilServer;

fn test_config(recordings: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.devices.camera_tokens = vec!["camera-secret".to_string()];
    config.devices.controller_tokens = vec!["controller-secret".to_string()];
    config.viewers.tokens = vec![ViewerToken {
        token: "viewer-secret".to_string(),
        principal: "owner".to_string(),
    }];
    config.recording.directory = recordings.to_path_buf();
    config.recording.min_frames = 1;
    config.recording.absolute_min_size = 0;
    config.server.drain_timeout_secs = 5;
    config
}

fn camera_jpeg() -> Vec<u8> {
    let img = RgbImage::from_fn(64, 48, |x, y| Rgb([(x * 4) as u8, (y * 5) as u8, 128]));
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 85)
        .encode(img.as_raw(), 64, 48, image::ExtendedColorType::Rgb8)
        .unwrap();
    out
}

#[tokio::test]
async fn test_camera_to_viewer_with_recording() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    config.validate().unwrap();

    let server = VigilServer::new(config).await.unwrap();
    let shutdown = server.shutdown_token();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = tokio::spawn(server.serve(listener));

    let (mut camera, _) = connect_async(format!("ws://{}/ws/camera", addr)).await.unwrap();
    authenticate(&mut camera, "camera-secret").await;
    expect_control(&mut camera, "connection_ack").await;

    let (mut viewer, _) = connect_async(format!("ws://{}/ws/viewer", addr)).await.unwrap();
    authenticate(&mut viewer, "viewer-secret").await;
    expect_control(&mut viewer, "connection_ack").await;

    camera.send(Message::Binary(camera_jpeg())).await.unwrap();
    let live = expect_binary(&mut viewer).await;
    assert_eq!(&live[..2], &[0xff, 0xd8]);

    // Status reflects the connected camera.
    send_control(&mut viewer, &ControlMessage::Status { data: None }).await;
    loop {
        if let ControlMessage::Status { data: Some(data) } = expect_control(&mut viewer, "status").await {
            if data.get("device_online").is_some() {
                assert_eq!(data["device_online"]["camera"], json!(true));
                break;
            }
        }
    }

    shutdown.cancel();
    assert_eq!(close_code(&expect_close(&mut camera).await), Some(1001));
    assert_eq!(close_code(&expect_close(&mut viewer).await), Some(1001));
    serving.await.unwrap().unwrap();

    let index = std::fs::read_to_string(JsonIndexCatalog::new(dir.path()).index_path()).unwrap();
    assert!(!index.trim().is_empty());
}

#[tokio::test]
async fn test_viewer_commands_reach_controller() {
    let dir = tempfile::tempdir().unwrap();
    let server = VigilServer::new(test_config(dir.path())).await.unwrap();
    let shutdown = server.shutdown_token();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = tokio::spawn(server.serve(listener));

    let (mut viewer, _) = connect_async(format!("ws://{}/ws/viewer", addr)).await.unwrap();
    authenticate(&mut viewer, "viewer-secret").await;
    expect_control(&mut viewer, "connection_ack").await;

    let command = ControlMessage::Action {
        command: json!({"flash": true}),
    };

    // No controller yet
    send_control(&mut viewer, &command).await;
    let undelivered = loop {
        if let ControlMessage::Status { data: Some(data) } = expect_control(&mut viewer, "status").await {
            if data.get("delivered").is_some() {
                break data;
            }
        }
    };
    assert_eq!(undelivered["delivered"], json!(false));

    let (mut controller, _) = connect_async(format!("ws://{}/ws/controller", addr)).await.unwrap();
    authenticate(&mut controller, "controller-secret").await;
    expect_control(&mut controller, "connection_ack").await;

    send_control(&mut viewer, &command).await;
    assert_eq!(expect_control(&mut controller, "action").await, command);

    shutdown.cancel();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_path_refused() {
    let dir = tempfile::tempdir().unwrap();
    let server = VigilServer::new(test_config(dir.path())).await.unwrap();
    let shutdown = server.shutdown_token();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = tokio::spawn(server.serve(listener));

    match connect_async(format!("ws://{}/ws/admin", addr)).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 404),
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("upgrade should have been refused"),
    }

    shutdown.cancel();
    serving.await.unwrap().unwrap();
}
