//! Token authentication
//!
//! Device links present a role token; viewer links present a session
//! token issued by the account side of the appliance. Both are checked
//! here. Tokens are kept only as SHA-256 digests and compared without
//! early exit.

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::link::DeviceRole;

/// Longest token accepted on the wire
pub const MAX_TOKEN_LEN: usize = 4096;

/// Identity a viewer token resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Account or client name
    pub name: String,
}

/// Viewer token check, provided by the account collaborator
pub trait Authorizer: Send + Sync {
    /// Resolve a token to a principal, or `None` when it is not valid
    fn is_authorized(&self, token: &str) -> Option<Principal>;
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct TokenDigest([u8; 32]);

impl TokenDigest {
    fn of(token: &str) -> Self {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(token.as_bytes()));
        Self(out)
    }

    fn matches(&self, other: &TokenDigest) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl std::fmt::Debug for TokenDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenDigest({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

fn well_formed(token: &str) -> bool {
    !token.is_empty() && token.len() <= MAX_TOKEN_LEN
}

/// Authorizer backed by a fixed token table
#[derive(Debug, Default)]
pub struct StaticTokenAuthorizer {
    entries: Vec<(TokenDigest, Principal)>,
}

impl StaticTokenAuthorizer {
    /// Build from `(token, principal name)` pairs
    pub fn new<I, T, N>(tokens: I) -> Self
    where
        I: IntoIterator<Item = (T, N)>,
        T: AsRef<str>,
        N: Into<String>,
    {
        let entries: Vec<_> = tokens
            .into_iter()
            .filter(|(token, _)| well_formed(token.as_ref()))
            .map(|(token, name)| (TokenDigest::of(token.as_ref()), Principal { name: name.into() }))
            .collect();
        info!("Viewer authorizer loaded with {} tokens", entries.len());
        Self { entries }
    }
}

impl Authorizer for StaticTokenAuthorizer {
    fn is_authorized(&self, token: &str) -> Option<Principal> {
        if !well_formed(token) {
            return None;
        }
        let presented = TokenDigest::of(token);
        let mut found = None;
        // Walk every entry so timing does not reveal the match position.
        for (digest, principal) in &self.entries {
            if digest.matches(&presented) && found.is_none() {
                found = Some(principal.clone());
            }
        }
        if found.is_none() {
            debug!("Viewer token rejected");
        }
        found
    }
}

/// Accepted tokens per device role
#[derive(Debug, Default)]
pub struct DeviceCredentials {
    camera: Vec<TokenDigest>,
    controller: Vec<TokenDigest>,
}

impl DeviceCredentials {
    /// Build from plain-text token lists
    pub fn new(camera_tokens: &[String], controller_tokens: &[String]) -> Self {
        let digest_all = |tokens: &[String]| -> Vec<TokenDigest> {
            tokens
                .iter()
                .filter(|t| well_formed(t))
                .map(|t| TokenDigest::of(t))
                .collect()
        };
        let creds = Self {
            camera: digest_all(camera_tokens),
            controller: digest_all(controller_tokens),
        };
        if creds.camera.is_empty() || creds.controller.is_empty() {
            warn!("A device role has no accepted tokens; its links will always be rejected");
        }
        creds
    }

    /// Whether `token` is one of the role's accepted tokens
    pub fn accepts(&self, role: DeviceRole, token: &str) -> bool {
        if !well_formed(token) {
            return false;
        }
        let presented = TokenDigest::of(token);
        let accepted = match role {
            DeviceRole::Camera => &self.camera,
            DeviceRole::Controller => &self.controller,
        };
        accepted
            .iter()
            .fold(false, |hit, digest| digest.matches(&presented) | hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_tokens_are_per_role() {
        let creds = DeviceCredentials::new(
            &["cam-secret".to_string()],
            &["ctl-secret".to_string(), "ctl-spare".to_string()],
        );
        assert!(creds.accepts(DeviceRole::Camera, "cam-secret"));
        assert!(!creds.accepts(DeviceRole::Camera, "ctl-secret"));
        assert!(creds.accepts(DeviceRole::Controller, "ctl-spare"));
        assert!(!creds.accepts(DeviceRole::Controller, ""));
    }

    #[test]
    fn test_empty_tokens_never_configured() {
        let creds = DeviceCredentials::new(&[String::new()], &[]);
        assert!(!creds.accepts(DeviceRole::Camera, ""));
    }

    #[test]
    fn test_static_authorizer() {
        let auth = StaticTokenAuthorizer::new([("viewer-1", "alice"), ("viewer-2", "bob")]);
        assert_eq!(
            auth.is_authorized("viewer-2"),
            Some(Principal {
                name: "bob".to_string()
            })
        );
        assert_eq!(auth.is_authorized("viewer-3"), None);
        assert_eq!(auth.is_authorized(&"x".repeat(MAX_TOKEN_LEN + 1)), None);
    }
}
