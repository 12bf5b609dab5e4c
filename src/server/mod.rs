//! Server Implementation Module
//!
//! Composition root: builds every subsystem from the [`Config`], wires the
//! frame path and runs the long-lived tasks.
//!
//! # Architecture
//!
//! ```text
//! VigilServer
//!   ├─> Accept loop (/ws/camera, /ws/controller, /ws/viewer)
//!   │     ├─> Device sessions ──> CameraIngest / ControllerReports
//!   │     └─> Viewer sessions ──> BroadcastHub, CommandRelay
//!   ├─> Quality tick (PerformanceMonitor ──> QualityController ──> PipelineTuning)
//!   ├─> Recorder (segments, retry queue, catalog)
//!   ├─> Broadcast pacing (FrameBuffer latest ──> viewers)
//!   ├─> Status forwarder (StatusBoard changes ──> viewers)
//!   └─> Retention sweeper
//! ```
//!
//! # Shutdown
//!
//! Every task observes one [`CancellationToken`]. Ctrl-C cancels it; device
//! and viewer links close, the recorder drains its queue and force-flushes
//! the active segment, and the server waits up to `server.drain_timeout`
//! for all of it before aborting stragglers.
//!
//! # Example
//!
//! ```no_run
//! use vigil_server::config::Config;
//! use vigil_server::server::VigilServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml")?;
//!     let server = VigilServer::new(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

mod ingest;
mod relay;
mod router;

pub use ingest::{CameraIngest, ControllerReports};
pub use relay::{ApplianceStatus, CommandRelay};
pub use router::{run_accept_loop, serve_connection, Route, Routes};

use anyhow::{Context, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broadcast::{BroadcastHub, ViewerSessionContext};
use crate::buffer::FrameBuffer;
use crate::config::Config;
use crate::events::{EventLog, EventSink};
use crate::link::{CloseReason, ControlMessage, DeviceSessionContext, LinkHandler, LinkRegistry};
use crate::performance::{PerformanceMonitor, PipelineTuning, QualityController};
use crate::processor::FrameProcessor;
use crate::recording::{run_retention, JsonIndexCatalog, Recorder, RecorderHandle};
use crate::security::{DeviceCredentials, StaticTokenAuthorizer};
use crate::status::{StatusBoard, SystemStatus};

/// Vigil server
pub struct VigilServer {
    config: Arc<Config>,
    events: Arc<EventLog>,
    status: Arc<StatusBoard>,
    registry: Arc<LinkRegistry>,
    buffer: Arc<FrameBuffer>,
    monitor: Arc<PerformanceMonitor>,
    tuning: Arc<PipelineTuning>,
    controller: QualityController,
    processor: Arc<FrameProcessor>,
    recorder: Option<Recorder>,
    recorder_handle: Option<Arc<RecorderHandle>>,
    hub: Arc<BroadcastHub>,
    appliance: Arc<ApplianceStatus>,
    routes: Arc<Routes>,
    shutdown: CancellationToken,
}

impl VigilServer {
    /// Build every subsystem
    ///
    /// Fails fast when the recordings directory cannot be created.
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing Vigil Server");
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();

        let events = Arc::new(EventLog::new(config.server.event_log_capacity));
        let sink: Arc<dyn EventSink> = events.clone();
        let status = Arc::new(StatusBoard::new(config.link.recent_errors));
        let registry = Arc::new(LinkRegistry::new());

        let buffer = Arc::new(FrameBuffer::new(config.buffer.clone()));
        let monitor = Arc::new(PerformanceMonitor::new(config.monitor.clone()));
        let controller = QualityController::new(config.quality.clone());
        let tuning = Arc::new(PipelineTuning::new(controller.quality()));
        let processor = Arc::new(FrameProcessor::new(
            config.processor.clone(),
            Arc::clone(&tuning),
            Arc::clone(&sink),
        ));
        info!(
            "Frame path: buffer {} frames, processing {}, initial quality {}",
            config.buffer.capacity,
            if config.processor.processing_enabled { "on" } else { "off" },
            controller.quality()
        );

        let (recorder, recorder_handle) = if config.recording.enabled {
            let catalog = Arc::new(JsonIndexCatalog::new(&config.recording.directory));
            let (recorder, handle) = Recorder::new(config.recording.clone(), catalog, Arc::clone(&sink));
            recorder.prepare().await.with_context(|| {
                format!(
                    "Failed to prepare recordings directory {}",
                    config.recording.directory.display()
                )
            })?;
            info!("Recording to {}", recorder.root().display());
            (Some(recorder), Some(handle))
        } else {
            info!("Recording disabled in configuration");
            (None, None)
        };

        let hub = BroadcastHub::new(config.broadcast.clone());
        let appliance = Arc::new(ApplianceStatus::new(
            Arc::clone(&status),
            Arc::clone(&buffer),
            Arc::clone(&monitor),
        ));
        let relay = Arc::new(CommandRelay::new(
            Arc::clone(&registry),
            Arc::clone(&appliance),
            Arc::clone(&sink),
        ));

        let credentials = Arc::new(DeviceCredentials::new(
            &config.devices.camera_tokens,
            &config.devices.controller_tokens,
        ));
        let authorizer = Arc::new(StaticTokenAuthorizer::new(
            config
                .viewers
                .tokens
                .iter()
                .map(|entry| (entry.token.as_str(), entry.principal.clone())),
        ));

        let camera: Arc<dyn LinkHandler> = Arc::new(CameraIngest::new(
            Arc::clone(&processor),
            Arc::clone(&buffer),
            Arc::clone(&monitor),
            recorder_handle.clone(),
            Arc::clone(&sink),
        ));
        let controller_reports: Arc<dyn LinkHandler> = Arc::new(ControllerReports::new(Arc::clone(&sink)));
        let device_context = |handler: Arc<dyn LinkHandler>| DeviceSessionContext {
            registry: Arc::clone(&registry),
            credentials: Arc::clone(&credentials),
            status: Arc::clone(&status),
            events: Arc::clone(&sink),
            handler,
            config: config.link.clone(),
            shutdown: shutdown.clone(),
        };
        let routes = Arc::new(Routes {
            camera: device_context(camera),
            controller: device_context(controller_reports),
            viewer: ViewerSessionContext {
                hub: Arc::clone(&hub),
                authorizer,
                requests: relay,
                events: Arc::clone(&sink),
                link: config.link.clone(),
                shutdown: shutdown.clone(),
            },
            max_message_bytes: config.link.max_message_bytes,
        });

        info!("Vigil Server initialized successfully");

        Ok(Self {
            config,
            events,
            status,
            registry,
            buffer,
            monitor,
            tuning,
            controller,
            processor,
            recorder,
            recorder_handle,
            hub,
            appliance,
            routes,
            shutdown,
        })
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Appliance status for the web side
    pub fn current_status(&self) -> SystemStatus {
        self.appliance.current()
    }

    /// Most recent processed frame
    pub fn latest_frame(&self) -> Option<Bytes> {
        self.buffer.latest().map(|frame| frame.payload.clone())
    }

    /// In-memory event log
    pub fn events(&self) -> Arc<EventLog> {
        Arc::clone(&self.events)
    }

    /// Frame processor, for statistics
    pub fn processor(&self) -> Arc<FrameProcessor> {
        Arc::clone(&self.processor)
    }

    /// Recorder handle, when recording is enabled
    pub fn recorder(&self) -> Option<Arc<RecorderHandle>> {
        self.recorder_handle.clone()
    }

    /// Broadcast hub
    pub fn hub(&self) -> Arc<BroadcastHub> {
        Arc::clone(&self.hub)
    }

    /// Bind the configured address and serve until Ctrl-C
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .server
            .listen_addr
            .parse()
            .context("Invalid listen address")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind listen address {}", addr))?;

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        info!("Ctrl-C received, shutting down");
                        shutdown.cancel();
                    }
                    Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
                },
            }
        });

        self.serve(listener).await
    }

    /// Serve on an already bound listener until the shutdown token fires
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr().context("Listener has no local address")?;
        info!("╔════════════════════════════════════════════════════════════╗");
        info!("║          Vigil Server is Starting                          ║");
        info!("╚════════════════════════════════════════════════════════════╝");
        info!("  Listen Address: {}", local);
        info!("  Links: /ws/camera, /ws/controller, /ws/viewer");
        info!("  Max Viewers: {}", self.config.broadcast.max_viewers);
        info!("  Recording: {}", if self.recorder.is_some() { "enabled" } else { "disabled" });
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        let Self {
            config,
            events,
            status,
            registry,
            buffer,
            monitor,
            tuning,
            controller,
            recorder,
            hub,
            routes,
            shutdown,
            ..
        } = self;
        let sink: Arc<dyn EventSink> = events;
        let mut tasks = JoinSet::new();

        tasks.spawn(run_accept_loop(listener, routes, shutdown.clone()));
        tasks.spawn(run_quality_loop(
            controller,
            Arc::clone(&monitor),
            Arc::clone(&buffer),
            Arc::clone(&tuning),
            Duration::from_millis(config.quality.tick_interval_ms.max(1)),
            shutdown.clone(),
        ));
        if let Some(recorder) = recorder {
            tasks.spawn(recorder.run(shutdown.clone()));
            tasks.spawn(run_retention(config.recording.clone(), Arc::clone(&sink), shutdown.clone()));
        }
        tasks.spawn(Arc::clone(&hub).run_pacing(Arc::clone(&buffer), tuning, shutdown.clone()));
        tasks.spawn(forward_status(status, Arc::clone(&hub), shutdown.clone()));

        info!("Server is ready and listening for links");
        shutdown.cancelled().await;

        info!("Shutdown started, draining for up to {:?}", config.server.drain_timeout());
        registry.close_all(CloseReason::Shutdown);
        let drained = tokio::time::timeout(config.server.drain_timeout(), async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Server task panicked: {}", e);
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Drain timeout exceeded, aborting {} remaining tasks", tasks.len());
            tasks.abort_all();
        }

        info!("Vigil Server shutdown complete");
        Ok(())
    }
}

/// Feed monitor snapshots through the controller on a fixed tick
async fn run_quality_loop(
    mut controller: QualityController,
    monitor: Arc<PerformanceMonitor>,
    buffer: Arc<FrameBuffer>,
    tuning: Arc<PipelineTuning>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = monitor.snapshot(buffer.utilization());
        let decision = controller.evaluate(&snapshot);
        tuning.apply(&decision);
        if decision.changed() {
            info!(
                "Quality {} -> {} ({} band, {:.1} fps, compensation {:.2})",
                decision.previous_quality, decision.quality, decision.band, snapshot.fps, decision.compensation
            );
        }
    }
    let stats = controller.stats();
    debug!(
        "Quality loop stopped after {} ticks ({} reductions, {} increases)",
        stats.ticks, stats.reductions, stats.increases
    );
}

/// Forward status board changes to viewers as `status` events
async fn forward_status(status: Arc<StatusBoard>, hub: Arc<BroadcastHub>, shutdown: CancellationToken) {
    let mut changes = status.subscribe();
    loop {
        let change = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            change = changes.recv() => change,
        };
        match change {
            Ok(change) => {
                let message = ControlMessage::Status {
                    data: serde_json::to_value(&change).ok(),
                };
                hub.publish_event(&message.to_json());
            }
            Err(RecvError::Lagged(missed)) => debug!("Status forwarder skipped {} changes", missed),
            Err(RecvError::Closed) => break,
        }
    }
}
