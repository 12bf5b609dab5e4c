//! Connection registry
//!
//! At most one authoritative link per role. Registering a newly
//! authenticated link supersedes and closes whatever link held the role.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::device::{DeviceLink, LinkInfo, Outbound};
use super::error::LinkError;
use super::protocol::ControlMessage;
use super::state::{CloseReason, DeviceRole};

/// Authoritative link per role
#[derive(Default)]
pub struct LinkRegistry {
    links: Mutex<HashMap<DeviceRole, Arc<DeviceLink>>>,
}

impl LinkRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate `link` and make it authoritative for its role
    ///
    /// The Active transition and the swap happen under the registry lock, so
    /// concurrent handshakes for one role publish status in the same order
    /// they replace each other. The previous holder is closed afterwards.
    pub fn activate(&self, link: Arc<DeviceLink>) -> Result<Option<Arc<DeviceLink>>, LinkError> {
        let role = link.role();
        let previous = {
            let mut links = self.links.lock();
            link.activate()?;
            links.insert(role, Arc::clone(&link))
        };

        // Close outside the registry lock: close() publishes status.
        if let Some(old) = &previous {
            if old.id() != link.id() {
                info!(
                    "{} link {} supersedes {}",
                    role,
                    link.id(),
                    old.id()
                );
                old.close(CloseReason::Superseded);
            }
        }
        Ok(previous)
    }

    /// Drop the role's entry if it still points at `link_id`
    pub fn remove_if_current(&self, role: DeviceRole, link_id: Uuid) -> bool {
        let mut links = self.links.lock();
        match links.get(&role) {
            Some(current) if current.id() == link_id => {
                links.remove(&role);
                debug!("{} link {} unregistered", role, link_id);
                true
            }
            _ => false,
        }
    }

    /// Authoritative link for `role`
    pub fn get(&self, role: DeviceRole) -> Option<Arc<DeviceLink>> {
        self.links.lock().get(&role).cloned()
    }

    /// Queue a control message to the role's link
    pub fn send_to(&self, role: DeviceRole, message: ControlMessage) -> bool {
        match self.get(role) {
            Some(link) => link.send(Outbound::Control(message)),
            None => {
                debug!("No {} link; dropping {}", role, message.kind());
                false
            }
        }
    }

    /// Snapshot of every registered link
    pub fn list(&self) -> Vec<LinkInfo> {
        let links: Vec<_> = self.links.lock().values().cloned().collect();
        links.iter().map(|l| l.info()).collect()
    }

    /// Close every registered link
    pub fn close_all(&self, reason: CloseReason) {
        let links: Vec<_> = self.links.lock().drain().map(|(_, l)| l).collect();
        for link in links {
            link.close(reason.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkState;
    use crate::status::StatusBoard;

    fn authenticated(role: DeviceRole, status: &Arc<StatusBoard>) -> Arc<DeviceLink> {
        let (link, _rx) = DeviceLink::new(role, "peer", Arc::clone(status), 8, 5);
        link.begin_authentication().unwrap();
        link
    }

    #[test]
    fn test_newer_link_supersedes() {
        let status = Arc::new(StatusBoard::new(5));
        let registry = LinkRegistry::new();

        let first = authenticated(DeviceRole::Camera, &status);
        registry.activate(Arc::clone(&first)).unwrap();
        let second = authenticated(DeviceRole::Camera, &status);
        let previous = registry.activate(Arc::clone(&second)).unwrap();

        assert_eq!(previous.map(|l| l.id()), Some(first.id()));
        assert_eq!(first.state(), LinkState::Closed);
        assert_eq!(first.close_reason(), Some(CloseReason::Superseded));
        assert_eq!(second.state(), LinkState::Active);

        let active: Vec<_> = registry
            .list()
            .into_iter()
            .filter(|l| l.role == DeviceRole::Camera && l.state == LinkState::Active)
            .collect();
        assert_eq!(active.len(), 1);
        assert!(status.is_online(DeviceRole::Camera));
    }

    #[test]
    fn test_roles_are_independent() {
        let status = Arc::new(StatusBoard::new(5));
        let registry = LinkRegistry::new();
        let cam = authenticated(DeviceRole::Camera, &status);
        let ctl = authenticated(DeviceRole::Controller, &status);
        registry.activate(Arc::clone(&cam)).unwrap();
        registry.activate(Arc::clone(&ctl)).unwrap();

        assert_eq!(cam.state(), LinkState::Active);
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn test_stale_removal_ignored() {
        let status = Arc::new(StatusBoard::new(5));
        let registry = LinkRegistry::new();
        let first = authenticated(DeviceRole::Controller, &status);
        let second = authenticated(DeviceRole::Controller, &status);
        registry.activate(Arc::clone(&first)).unwrap();
        registry.activate(Arc::clone(&second)).unwrap();

        assert!(!registry.remove_if_current(DeviceRole::Controller, first.id()));
        assert!(registry.get(DeviceRole::Controller).is_some());
        assert!(registry.remove_if_current(DeviceRole::Controller, second.id()));
        assert!(registry.get(DeviceRole::Controller).is_none());
    }

    #[test]
    fn test_closed_link_not_registered() {
        let status = Arc::new(StatusBoard::new(5));
        let registry = LinkRegistry::new();
        let link = authenticated(DeviceRole::Camera, &status);
        link.close(CloseReason::AuthTimeout);

        assert!(registry.activate(Arc::clone(&link)).is_err());
        assert!(registry.get(DeviceRole::Camera).is_none());
    }

    #[test]
    fn test_concurrent_handshakes_keep_status_consistent() {
        let status = Arc::new(StatusBoard::new(5));
        let registry = Arc::new(LinkRegistry::new());

        for _ in 0..50 {
            let links: Vec<_> = (0..4)
                .map(|_| authenticated(DeviceRole::Camera, &status))
                .collect();
            let handles: Vec<_> = links
                .iter()
                .map(|link| {
                    let registry = Arc::clone(&registry);
                    let link = Arc::clone(link);
                    std::thread::spawn(move || {
                        let _ = registry.activate(link);
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let current = registry.get(DeviceRole::Camera).unwrap();
            assert_eq!(current.state(), LinkState::Active);
            assert!(status.is_online(DeviceRole::Camera));
            let survivors = links.iter().filter(|l| l.state() == LinkState::Active).count();
            assert_eq!(survivors, 1);
        }
    }

    #[test]
    fn test_send_to_missing_role() {
        let registry = LinkRegistry::new();
        assert!(!registry.send_to(
            DeviceRole::Controller,
            ControlMessage::Ping { timestamp: None }
        ));
    }
}
