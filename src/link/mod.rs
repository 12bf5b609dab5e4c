//! Device links
//!
//! One websocket per peripheral role (camera, controller). Each link runs
//! the same lifecycle:
//!
//! ```text
//! Connecting ──> Authenticating ──> Active <──> Degraded
//!      │               │               │            │
//!      └───────────────┴───────────────┴────────────┴──> Closed
//! ```
//!
//! - At most one link per role is authoritative; a newer authenticated
//!   link supersedes the older one ([`LinkRegistry`]).
//! - Liveness is tracked by an adaptive [`Heartbeat`]: links that stream
//!   are probed rarely, silent links are probed with escalating gaps and
//!   closed after a bounded number of unanswered probes.
//! - Errors (malformed payloads, failed sends) are counted and degrade
//!   the link past a threshold; any success recovers it.

mod device;
mod error;
mod heartbeat;
mod protocol;
mod registry;
mod session;
mod state;

pub use device::{DeviceLink, LinkInfo, Outbound};
pub use error::LinkError;
pub use heartbeat::{Heartbeat, HeartbeatAction, HeartbeatConfig};
pub use protocol::{ControlMessage, ProtocolError};
pub use registry::LinkRegistry;
pub use session::{
    role_category, run_device_session, DeviceSessionContext, LinkConfig, LinkHandler,
};
pub(crate) use session::{await_credential, send_close, write_control, write_message};
pub use state::{CloseReason, DeviceRole, LinkState, LinkStateMachine};
