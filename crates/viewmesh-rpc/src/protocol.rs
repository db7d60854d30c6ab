//! Wire types of the signed command protocol
//!
//! A [`Command`] is wrapped with a [`Header`] into a [`CommandEnvelope`],
//! serialized, and signed by its creator. The server answers with a
//! [`CommandResponse`], serialized into a [`SignedCommandResponse`]. All
//! bytes on the wire are bincode.

use serde::{Deserialize, Serialize};
use std::fmt;
use viewmesh_core::{Result, ViewMeshError};

/// Length of the random nonce carried by every header
pub const NONCE_LEN: usize = 32;

/// Operation requested by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Start a view in the background
    InitiateView {
        /// Factory id
        fid: String,
        /// Factory input
        input: Vec<u8>,
    },
    /// Query a view started with `InitiateView`
    TrackView {
        /// Context id returned by `InitiateView`
        cid: String,
    },
    /// Run a view to completion
    CallView {
        /// Factory id
        fid: String,
        /// Factory input
        input: Vec<u8>,
    },
    /// Ask whether a transaction is final
    IsTxFinal {
        /// Transaction id
        txid: String,
    },
    /// Subscribe to finality of the transaction with the given digest
    IsHashFinal {
        /// Digest of the transaction id
        hash: Vec<u8>,
    },
}

impl Command {
    /// Short variant name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitiateView { .. } => "InitiateView",
            Self::TrackView { .. } => "TrackView",
            Self::CallView { .. } => "CallView",
            Self::IsTxFinal { .. } => "IsTxFinal",
            Self::IsHashFinal { .. } => "IsHashFinal",
        }
    }
}

/// Authentication header bound into every signed command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Creation time, milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Fresh random bytes, [`NONCE_LEN`] long
    pub nonce: Vec<u8>,
    /// Serialized identity of the signer
    pub creator: Vec<u8>,
    /// SHA-256 of the client TLS certificate, when one is in use
    pub tls_cert_hash: Option<Vec<u8>>,
}

/// Header plus command; the unit that gets signed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Authentication header
    pub header: Header,
    /// Requested operation
    pub command: Command,
}

impl CommandEnvelope {
    /// Canonical bytes covered by the signature
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode canonical bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| ViewMeshError::protocol(format!("malformed command: {e}")))
    }
}

/// Serialized envelope and its signature
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCommand {
    /// Serialized [`CommandEnvelope`]
    pub command: Vec<u8>,
    /// Creator's signature over `command`
    pub signature: Vec<u8>,
}

impl fmt::Debug for SignedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedCommand")
            .field("command_len", &self.command.len())
            .field("signature", &hex::encode(&self.signature))
            .finish()
    }
}

/// Finality frame pushed on an `IsHashFinal` stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashFinality {
    /// Whether the transaction is believed valid
    pub belief: bool,
    /// Whether `belief` can no longer change
    pub is_final: bool,
}

/// Server answer to a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResponse {
    /// The command failed; errors travel inside the response
    Err {
        /// Error text
        message: String,
    },
    /// Context id of the started view
    InitiateView {
        /// Context id
        cid: String,
    },
    /// Status of a tracked view
    TrackView {
        /// Status payload
        payload: Vec<u8>,
    },
    /// Output of a completed view
    CallView {
        /// View output
        result: Vec<u8>,
    },
    /// Empty when final, otherwise the reason it is not
    IsTxFinal {
        /// Reason payload
        payload: Vec<u8>,
    },
    /// One frame of an `IsHashFinal` stream
    IsHashFinal(HashFinality),
}

impl CommandResponse {
    /// Short variant name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::Err { .. } => "Err",
            Self::InitiateView { .. } => "InitiateView",
            Self::TrackView { .. } => "TrackView",
            Self::CallView { .. } => "CallView",
            Self::IsTxFinal { .. } => "IsTxFinal",
            Self::IsHashFinal(_) => "IsHashFinal",
        }
    }

    /// Wrap an error for the wire
    pub fn error(err: &ViewMeshError) -> Self {
        Self::Err {
            message: err.to_string(),
        }
    }
}

/// Serialized response and the server's optional signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCommandResponse {
    /// Serialized [`CommandResponse`]
    pub response: Vec<u8>,
    /// Server signature over `response`; empty when the server does not sign
    pub signature: Vec<u8>,
}

impl SignedCommandResponse {
    /// Decode the carried response
    pub fn decode(&self) -> Result<CommandResponse> {
        bincode::deserialize(&self.response)
            .map_err(|e| ViewMeshError::protocol(format!("failed to unmarshal command response: {e}")))
    }
}

/// How the server should answer a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    /// One response, then the connection closes
    Unary,
    /// Responses until the server ends the stream
    Stream,
}

/// First frame a client writes on a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Unary or streaming call
    pub kind: CallKind,
    /// The signed command
    pub command: SignedCommand,
}
