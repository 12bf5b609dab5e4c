//! Role status board
//!
//! Tracks, per device role, whether the peripheral is online, when it was
//! last heard from and a bounded list of recent errors. Device links
//! publish every state transition here.
//!
//! Only the authoritative link of a role may flip the role offline: when a
//! newer connection supersedes an older one, the older link's `Closed`
//! transition is recorded for the log but does not mark the role offline.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::link::{DeviceRole, LinkState};

const CHANGE_FEED_CAPACITY: usize = 64;

/// One recorded error
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorEntry {
    /// When it was recorded
    pub at: DateTime<Utc>,
    /// Error text
    pub message: String,
}

/// Status of one role
#[derive(Debug, Clone, Serialize)]
pub struct RoleStatus {
    /// Role
    pub role: DeviceRole,
    /// Authoritative link is Active or Degraded
    pub online: bool,
    /// State of the authoritative link
    pub state: LinkState,
    /// Authoritative link id
    pub link_id: Option<Uuid>,
    /// Last inbound traffic
    pub last_seen: Option<DateTime<Utc>>,
    /// Errors recorded since startup
    pub error_count: u64,
    /// Most recent errors, oldest first
    pub recent_errors: VecDeque<ErrorEntry>,
}

impl RoleStatus {
    fn new(role: DeviceRole) -> Self {
        Self {
            role,
            online: false,
            state: LinkState::Closed,
            link_id: None,
            last_seen: None,
            error_count: 0,
            recent_errors: VecDeque::new(),
        }
    }
}

/// Change notification for subscribers (viewer status feed)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusChange {
    /// Authoritative link changed state
    Transition {
        /// Role
        role: DeviceRole,
        /// New state
        state: LinkState,
        /// Online after the change
        online: bool,
    },
    /// Error recorded for a role
    Error {
        /// Role
        role: DeviceRole,
        /// Error text
        message: String,
    },
}

/// Appliance-wide status, as exposed to the web side
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    /// Online flag per role
    pub device_online: BTreeMap<String, bool>,
    /// Last inbound traffic per role
    pub last_seen: BTreeMap<String, Option<DateTime<Utc>>>,
    /// Errors recorded per role
    pub error_counts: BTreeMap<String, u64>,
    /// Frame buffer fill level
    pub buffer_utilization: f64,
    /// Measured ingest frame rate
    pub fps: f64,
}

/// Per-role status registry
pub struct StatusBoard {
    recent_error_limit: usize,
    roles: RwLock<HashMap<DeviceRole, RoleStatus>>,
    changes: broadcast::Sender<StatusChange>,
}

impl StatusBoard {
    /// Keep at most `recent_error_limit` errors per role
    pub fn new(recent_error_limit: usize) -> Self {
        let roles = DeviceRole::ALL
            .iter()
            .map(|role| (*role, RoleStatus::new(*role)))
            .collect();
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            recent_error_limit: recent_error_limit.max(1),
            roles: RwLock::new(roles),
            changes,
        }
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.changes.subscribe()
    }

    /// Record a link state transition
    pub fn record_transition(&self, role: DeviceRole, link_id: Uuid, state: LinkState) {
        let change = {
            let mut roles = self.roles.write();
            let status = roles.entry(role).or_insert_with(|| RoleStatus::new(role));

            let authoritative = status.link_id == Some(link_id);
            if state == LinkState::Active && !authoritative {
                status.link_id = Some(link_id);
            } else if !authoritative {
                trace!(
                    "Ignoring {} transition to {} from non-authoritative link {}",
                    role,
                    state,
                    link_id
                );
                return;
            }

            status.state = state;
            status.online = state.is_online();
            if status.online {
                status.last_seen = Some(Utc::now());
            }
            StatusChange::Transition {
                role,
                state,
                online: status.online,
            }
        };

        debug!("{} status: {:?}", role, change);
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    /// Record inbound traffic from the authoritative link
    pub fn record_seen(&self, role: DeviceRole, link_id: Uuid) {
        let mut roles = self.roles.write();
        if let Some(status) = roles.get_mut(&role) {
            if status.link_id == Some(link_id) {
                status.last_seen = Some(Utc::now());
            }
        }
    }

    /// Append to the role's bounded error list
    pub fn record_error(&self, role: DeviceRole, message: impl Into<String>) {
        let message = message.into();
        {
            let mut roles = self.roles.write();
            let status = roles.entry(role).or_insert_with(|| RoleStatus::new(role));
            status.error_count += 1;
            if status.recent_errors.len() >= self.recent_error_limit {
                status.recent_errors.pop_front();
            }
            status.recent_errors.push_back(ErrorEntry {
                at: Utc::now(),
                message: message.clone(),
            });
        }
        let _ = self.changes.send(StatusChange::Error { role, message });
    }

    /// Status of one role
    pub fn role(&self, role: DeviceRole) -> RoleStatus {
        self.roles
            .read()
            .get(&role)
            .cloned()
            .unwrap_or_else(|| RoleStatus::new(role))
    }

    /// True when the role's authoritative link is up
    pub fn is_online(&self, role: DeviceRole) -> bool {
        self.roles.read().get(&role).map(|s| s.online).unwrap_or(false)
    }

    /// Appliance status with buffer and FPS figures supplied by the caller
    pub fn system_status(&self, buffer_utilization: f64, fps: f64) -> SystemStatus {
        let roles = self.roles.read();
        let mut status = SystemStatus {
            device_online: BTreeMap::new(),
            last_seen: BTreeMap::new(),
            error_counts: BTreeMap::new(),
            buffer_utilization,
            fps,
        };
        for role in DeviceRole::ALL {
            let name = role.as_str().to_string();
            let entry = roles.get(&role);
            status
                .device_online
                .insert(name.clone(), entry.map(|s| s.online).unwrap_or(false));
            status
                .last_seen
                .insert(name.clone(), entry.and_then(|s| s.last_seen));
            status
                .error_counts
                .insert(name, entry.map(|s| s.error_count).unwrap_or(0));
        }
        status
    }
}
