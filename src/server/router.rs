//! Connection routing
//!
//! One listener serves every link. The websocket upgrade request path
//! decides what the connection is:
//!
//! | Path | Session |
//! |------|---------|
//! | `/ws/camera` | device session, camera role |
//! | `/ws/controller` | device session, controller role |
//! | `/ws/viewer` | viewer session |
//!
//! Any other path is refused with `404` before the upgrade completes.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::{run_viewer_session, ViewerSessionContext};
use crate::link::{run_device_session, DeviceRole, DeviceSessionContext};

/// Link kind selected by the request path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Camera peripheral
    Camera,
    /// Servo/sensor controller
    Controller,
    /// Remote viewer
    Viewer,
}

impl Route {
    /// Route for a request path
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or(path);
        match path.trim_end_matches('/') {
            "/ws/camera" => Some(Self::Camera),
            "/ws/controller" => Some(Self::Controller),
            "/ws/viewer" => Some(Self::Viewer),
            _ => None,
        }
    }
}

/// Session contexts per route
pub struct Routes {
    /// Camera sessions
    pub camera: DeviceSessionContext,
    /// Controller sessions
    pub controller: DeviceSessionContext,
    /// Viewer sessions
    pub viewer: ViewerSessionContext,
    /// Largest websocket message accepted
    pub max_message_bytes: usize,
}

impl Routes {
    fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_bytes);
        config.max_frame_size = Some(self.max_message_bytes);
        config
    }

    async fn dispatch<S>(&self, route: Route, ws: WebSocketStream<S>, peer: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match route {
            Route::Camera => {
                run_device_session(ws, DeviceRole::Camera, peer, &self.camera).await;
            }
            Route::Controller => {
                run_device_session(ws, DeviceRole::Controller, peer, &self.controller).await;
            }
            Route::Viewer => {
                run_viewer_session(ws, peer, &self.viewer).await;
            }
        }
    }
}

/// Upgrade one connection and run the session its path selects
pub async fn serve_connection<S>(stream: S, peer: String, routes: &Routes)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut route = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match Route::from_path(request.uri().path()) {
            Some(found) => {
                route = Some(found);
                Ok(response)
            }
            None => {
                let mut refusal = ErrorResponse::new(Some(format!("no link at {}", request.uri().path())));
                *refusal.status_mut() = StatusCode::NOT_FOUND;
                Err(refusal)
            }
        }
    };

    let ws = match accept_hdr_async_with_config(stream, callback, Some(routes.websocket_config())).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Websocket upgrade from {} failed: {}", peer, e);
            return;
        }
    };
    let Some(route) = route else {
        return;
    };
    debug!("{} connected as {:?}", peer, route);
    routes.dispatch(route, ws, peer).await;
}

/// Accept connections until shutdown, then wait for open sessions
pub async fn run_accept_loop(listener: TcpListener, routes: Arc<Routes>, shutdown: CancellationToken) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay failed for {}: {}", addr, e);
                    }
                    let routes = Arc::clone(&routes);
                    sessions.spawn(async move {
                        serve_connection(stream, addr.to_string(), &routes).await;
                    });
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },

            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    info!("Listener closed, waiting for {} sessions", sessions.len());
    while sessions.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(Route::from_path("/ws/camera"), Some(Route::Camera));
        assert_eq!(Route::from_path("/ws/controller/"), Some(Route::Controller));
        assert_eq!(Route::from_path("/ws/viewer?session=1"), Some(Route::Viewer));
        assert_eq!(Route::from_path("/ws"), None);
        assert_eq!(Route::from_path("/"), None);
    }
}
