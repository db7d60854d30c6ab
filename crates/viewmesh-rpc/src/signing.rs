//! Building and opening signed commands

use crate::protocol::{Command, CommandEnvelope, Header, SignedCommand, NONCE_LEN};
use rand::rngs::OsRng;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};
use viewmesh_core::{Result, SigningIdentity, VerifierProvider, ViewMeshError};

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Wrap `command` in a fresh header and sign it
///
/// Every call draws a new nonce and timestamp, so two commands built from
/// the same input never share signed bytes.
pub fn create_signed_command(
    command: Command,
    signer: &dyn SigningIdentity,
    tls_cert_hash: Option<Vec<u8>>,
) -> Result<SignedCommand> {
    let mut nonce = vec![0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| ViewMeshError::crypto(format!("draw nonce: {e}")))?;

    let envelope = CommandEnvelope {
        header: Header {
            timestamp_ms: now_ms(),
            nonce,
            creator: signer.serialize()?,
            tls_cert_hash,
        },
        command,
    };
    let raw = envelope.to_bytes()?;
    let signature = signer.sign(&raw)?;
    Ok(SignedCommand {
        command: raw,
        signature,
    })
}

/// Decode `signed` and check the creator's signature over it
pub fn open_signed_command(
    signed: &SignedCommand,
    verifiers: &dyn VerifierProvider,
) -> Result<CommandEnvelope> {
    let envelope = CommandEnvelope::from_bytes(&signed.command)?;
    if envelope.header.creator.is_empty() {
        return Err(ViewMeshError::invalid("command creator is empty"));
    }
    verifiers
        .verifier(&envelope.header.creator)?
        .verify(&signed.command, &signed.signature)
        .map_err(|e| e.context("verify command signature"))?;
    Ok(envelope)
}
