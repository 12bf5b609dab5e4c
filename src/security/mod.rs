//! Security
//!
//! Credential checks for device and viewer links. The core does not define
//! an authentication protocol: devices present a pre-shared role token and
//! viewers present whatever token the account side issued, resolved through
//! the [`Authorizer`] trait.

pub mod auth;

pub use auth::{Authorizer, DeviceCredentials, Principal, StaticTokenAuthorizer, MAX_TOKEN_LEN};
