//! Shared helpers for websocket integration tests

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use vigil_server::link::ControlMessage;

pub type Ws = WebSocketStream<DuplexStream>;

const WAIT: Duration = Duration::from_secs(5);

/// Connected server/client websocket pair over an in-memory pipe
pub async fn ws_pair() -> (Ws, Ws) {
    let (server_io, client_io) = tokio::io::duplex(1 << 20);
    let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    (server, client)
}

pub async fn send_control<S>(ws: &mut WebSocketStream<S>, message: &ControlMessage)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ws.send(Message::Text(message.to_json())).await.unwrap();
}

pub async fn authenticate<S>(ws: &mut WebSocketStream<S>, token: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_control(
        ws,
        &ControlMessage::Authenticate {
            token: token.to_string(),
        },
    )
    .await;
}

/// Next control message of type `kind`, skipping anything else
pub async fn expect_control<S>(ws: &mut WebSocketStream<S>, kind: &str) -> ControlMessage
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let message = ControlMessage::parse(&text, usize::MAX).unwrap();
                    if message.kind() == kind {
                        return message;
                    }
                }
                Some(Ok(Message::Close(frame))) => panic!("closed while waiting for {}: {:?}", kind, frame),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("error while waiting for {}: {}", kind, e),
                None => panic!("stream ended while waiting for {}", kind),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", kind))
}

/// Next binary message, skipping text
pub async fn expect_binary<S>(ws: &mut WebSocketStream<S>) -> Vec<u8>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return data,
                Some(Ok(Message::Close(frame))) => panic!("closed while waiting for binary: {:?}", frame),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("error while waiting for binary: {}", e),
                None => panic!("stream ended while waiting for binary"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for binary"))
}

/// Close frame sent by the server, skipping anything before it
pub async fn expect_close<S>(ws: &mut WebSocketStream<S>) -> Option<CloseFrame<'static>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for close"))
}

pub fn close_code(frame: &Option<CloseFrame<'static>>) -> Option<u16> {
    frame.as_ref().map(|f| u16::from(f.code))
}
