//! Identities and identity resolution

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Opaque byte-string identity of a party
///
/// Identities are immutable values. Maps key them by [`Identity::unique_id`],
/// which is stable across processes.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Identity(Vec<u8>);

impl Identity {
    /// Wrap raw identity bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw identity bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the identity carries no bytes
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable string form: lowercase hex of the SHA-256 digest of the bytes
    pub fn unique_id(&self) -> String {
        hex::encode(Sha256::digest(&self.0))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.unique_id())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.unique_id())
    }
}

impl From<Vec<u8>> for Identity {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Identity {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for Identity {
    fn from(label: &str) -> Self {
        Self(label.as_bytes().to_vec())
    }
}

/// Named endpoints a party exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortName {
    /// Generic listen address
    Listen,
    /// Address of the signed command service
    View,
    /// Peer-to-peer session endpoint
    P2P,
}

/// Outcome of resolving an identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Canonical identity the input maps to
    pub identity: Identity,
    /// Named network endpoints of the party
    pub endpoints: HashMap<PortName, String>,
    /// Public-key material used to authenticate sessions to the party
    pub public_key: Vec<u8>,
}

impl Resolution {
    /// Endpoint registered under `port`, or a resolution error naming the party
    pub fn endpoint(&self, port: PortName) -> Result<&str> {
        self.endpoints
            .get(&port)
            .map(String::as_str)
            .ok_or_else(|| {
                crate::ViewMeshError::resolution(format!(
                    "party [{}] has no {port:?} endpoint",
                    self.identity
                ))
            })
    }
}

/// Maps an identity to its canonical identity, endpoints, and key material
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `party`
    async fn resolve(&self, party: &Identity) -> Result<Resolution>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_id_is_stable_hex_digest() {
        let alice = Identity::from("alice");
        assert_eq!(alice.unique_id(), Identity::new(b"alice".to_vec()).unique_id());
        assert_eq!(alice.unique_id().len(), 64);
        assert_ne!(alice.unique_id(), Identity::from("bob").unique_id());
    }

    #[test]
    fn test_missing_endpoint_is_resolution_error() {
        let resolution = Resolution {
            identity: Identity::from("alice"),
            endpoints: HashMap::from([(PortName::View, "127.0.0.1:9000".to_string())]),
            public_key: vec![],
        };
        assert_eq!(resolution.endpoint(PortName::View).ok(), Some("127.0.0.1:9000"));
        assert!(matches!(
            resolution.endpoint(PortName::P2P),
            Err(crate::ViewMeshError::Resolution { .. })
        ));
    }
}
