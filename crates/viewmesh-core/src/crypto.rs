//! Signing and verification capabilities
//!
//! The command protocol only needs an opaque sign/verify capability. The
//! Ed25519 implementation here is the reference identity used by the CLI and
//! the tests; other credential schemes plug in through the same traits.

use crate::{Identity, Result, ViewMeshError};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

/// SHA-256 digest of `data`
pub fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// A local identity able to sign
pub trait SigningIdentity: Send + Sync {
    /// Serialized public form of the identity, embedded as command creator
    fn serialize(&self) -> Result<Vec<u8>>;

    /// Sign `message`
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
}

/// Checks signatures of one identity
pub trait Verifier: Send + Sync {
    /// Verify `signature` over `message`
    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()>;
}

/// Builds verifiers from serialized creator identities
pub trait VerifierProvider: Send + Sync {
    /// Verifier for the serialized identity `creator`
    fn verifier(&self, creator: &[u8]) -> Result<Box<dyn Verifier>>;
}

/// Ed25519 signing identity; serializes to its 32-byte verifying key
#[derive(Clone)]
pub struct Ed25519SigningIdentity {
    key: SigningKey,
}

impl Ed25519SigningIdentity {
    /// Generate a fresh key from the OS random source
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load from 32 secret key bytes
    pub fn from_bytes(secret: &[u8]) -> Result<Self> {
        let secret: [u8; 32] = secret
            .try_into()
            .map_err(|_| ViewMeshError::crypto("ed25519 secret key must be 32 bytes"))?;
        Ok(Self {
            key: SigningKey::from_bytes(&secret),
        })
    }

    /// Load from a hex-encoded secret key, surrounding whitespace ignored
    pub fn from_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret.trim())
            .map_err(|e| ViewMeshError::crypto(format!("invalid hex secret key: {e}")))?;
        Self::from_bytes(&bytes)
    }

    /// Hex-encoded secret key
    pub fn to_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    /// Identity derived from the verifying key
    pub fn identity(&self) -> Identity {
        Identity::new(self.key.verifying_key().to_bytes().to_vec())
    }
}

impl SigningIdentity for Ed25519SigningIdentity {
    fn serialize(&self) -> Result<Vec<u8>> {
        Ok(self.key.verifying_key().to_bytes().to_vec())
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        Ok(self.key.sign(message).to_bytes().to_vec())
    }
}

/// Verifier for a single Ed25519 public key
pub struct Ed25519Verifier {
    key: VerifyingKey,
}

impl Ed25519Verifier {
    /// Build from a 32-byte verifying key
    pub fn from_bytes(public: &[u8]) -> Result<Self> {
        let public: [u8; 32] = public
            .try_into()
            .map_err(|_| ViewMeshError::crypto("ed25519 public key must be 32 bytes"))?;
        let key = VerifyingKey::from_bytes(&public)
            .map_err(|e| ViewMeshError::crypto(format!("invalid ed25519 public key: {e}")))?;
        Ok(Self { key })
    }
}

impl Verifier for Ed25519Verifier {
    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let signature = Signature::from_slice(signature)
            .map_err(|e| ViewMeshError::crypto(format!("malformed signature: {e}")))?;
        self.key
            .verify(message, &signature)
            .map_err(|_| ViewMeshError::crypto("signature verification failed"))
    }
}

/// Treats every creator as a serialized Ed25519 verifying key
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519VerifierProvider;

impl VerifierProvider for Ed25519VerifierProvider {
    fn verifier(&self, creator: &[u8]) -> Result<Box<dyn Verifier>> {
        Ok(Box::new(Ed25519Verifier::from_bytes(creator)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = Ed25519SigningIdentity::generate();
        let signature = signer.sign(b"payload").unwrap();
        let creator = signer.serialize().unwrap();

        let verifier = Ed25519VerifierProvider.verifier(&creator).unwrap();
        assert!(verifier.verify(b"payload", &signature).is_ok());
        assert!(verifier.verify(b"tampered", &signature).is_err());
    }

    #[test]
    fn test_hex_roundtrip_keeps_identity() {
        let signer = Ed25519SigningIdentity::generate();
        let restored = Ed25519SigningIdentity::from_hex(&format!("{}\n", signer.to_hex())).unwrap();
        assert_eq!(signer.identity(), restored.identity());
    }

    #[test]
    fn test_rejects_short_keys() {
        assert!(Ed25519SigningIdentity::from_bytes(&[0u8; 8]).is_err());
        assert!(Ed25519VerifierProvider.verifier(&[0u8; 8]).is_err());
    }
}
