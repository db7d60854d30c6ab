//! Session capability contracts
//!
//! A session is an ordered, bidirectional message channel to one remote
//! identity. Sessions move one way from open to closed; a closed session is
//! never reopened.

use crate::{Identity, Result, ViewMeshError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Whether a message carries a normal payload or an error report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Normal payload
    Ok,
    /// The sender reports a failure; the payload holds the error text
    Error,
}

/// A message delivered over a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Context the sender was running in
    pub context_id: String,
    /// Session the message travelled on
    pub session_id: String,
    /// Identity of the sender
    pub caller: Identity,
    /// Payload status
    pub status: MessageStatus,
    /// Message body
    pub payload: Vec<u8>,
}

/// Snapshot of a session's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session identifier, shared by both ends
    pub id: String,
    /// Remote party
    pub caller: Identity,
    /// Endpoint the session is bound to
    pub endpoint: String,
    /// Whether the session has been closed
    pub closed: bool,
}

/// Bidirectional ordered channel to one remote identity
#[async_trait]
pub trait Session: Send + Sync {
    /// Current state of the session
    fn info(&self) -> SessionInfo;

    /// Send a payload to the remote party
    async fn send(&self, payload: Vec<u8>) -> Result<()>;

    /// Report an error to the remote party
    async fn send_error(&self, payload: Vec<u8>) -> Result<()>;

    /// Next message in send order, or `None` once closed and drained
    async fn receive(&self) -> Option<Message>;

    /// Close the session; idempotent
    fn close(&self);

    /// Wait for the next payload, failing after `timeout`
    async fn receive_timeout(&self, timeout: Duration) -> Result<Vec<u8>> {
        let id = self.info().id;
        match tokio::time::timeout(timeout, self.receive()).await {
            Err(_) => Err(ViewMeshError::timeout(format!(
                "no message on session [{id}] within {timeout:?}"
            ))),
            Ok(None) => Err(ViewMeshError::session(format!(
                "session [{id}] closed while waiting for a message"
            ))),
            Ok(Some(msg)) => match msg.status {
                MessageStatus::Ok => Ok(msg.payload),
                MessageStatus::Error => Err(ViewMeshError::session(format!(
                    "remote error on session [{id}]: {}",
                    String::from_utf8_lossy(&msg.payload)
                ))),
            },
        }
    }
}

/// Creates sessions to remote endpoints
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a session labelled with `protocol` for context `context_id`
    async fn new_session(
        &self,
        protocol: &str,
        context_id: &str,
        endpoint: &str,
        public_key: &[u8],
    ) -> Result<Arc<dyn Session>>;

    /// Open a session whose identifier is chosen by the caller
    async fn new_session_with_id(
        &self,
        session_id: &str,
        context_id: &str,
        endpoint: &str,
        public_key: &[u8],
        caller: Option<&Identity>,
        first_message: Option<&Message>,
    ) -> Result<Arc<dyn Session>>;
}
