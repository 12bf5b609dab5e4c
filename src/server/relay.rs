//! Viewer-facing status and command relay

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::broadcast::ViewerRequests;
use crate::buffer::FrameBuffer;
use crate::events::{EventCategory, EventSink, Severity};
use crate::link::{ControlMessage, DeviceRole, LinkRegistry};
use crate::performance::PerformanceMonitor;
use crate::security::Principal;
use crate::status::{StatusBoard, SystemStatus};

/// Appliance-wide status assembled from the status board and the frame path
pub struct ApplianceStatus {
    status: Arc<StatusBoard>,
    buffer: Arc<FrameBuffer>,
    monitor: Arc<PerformanceMonitor>,
}

impl ApplianceStatus {
    /// Combine the status sources
    pub fn new(status: Arc<StatusBoard>, buffer: Arc<FrameBuffer>, monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            status,
            buffer,
            monitor,
        }
    }

    /// Status snapshot
    pub fn current(&self) -> SystemStatus {
        self.status
            .system_status(self.buffer.utilization(), self.monitor.current_fps())
    }
}

/// Serves viewer `status` requests and forwards `servo`/`action` commands
pub struct CommandRelay {
    registry: Arc<LinkRegistry>,
    appliance: Arc<ApplianceStatus>,
    events: Arc<dyn EventSink>,
}

impl CommandRelay {
    /// Relay through `registry`
    pub fn new(registry: Arc<LinkRegistry>, appliance: Arc<ApplianceStatus>, events: Arc<dyn EventSink>) -> Self {
        Self {
            registry,
            appliance,
            events,
        }
    }
}

impl ViewerRequests for CommandRelay {
    fn status_report(&self) -> Value {
        serde_json::to_value(self.appliance.current()).unwrap_or(Value::Null)
    }

    fn relay_command(&self, principal: &Principal, command: ControlMessage) -> bool {
        let kind = command.kind();
        let delivered = self.registry.send_to(DeviceRole::Controller, command);
        if delivered {
            debug!("Relayed {} command from {}", kind, principal.name);
        } else {
            self.events.emit_event(
                &format!("{} command from {} not delivered: controller offline", kind, principal.name),
                EventCategory::Controller,
                Severity::Warning,
            );
        }
        delivered
    }
}
