//! Command handler backed by a view manager and a transaction index

use crate::config::NodeConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use viewmesh_core::{sha256, Result, ValidationCode, ViewMeshError};
use viewmesh_rpc::{CommandHandler, HashFinality};
use viewmesh_store::{SeekPosition, TxIdIterator, TxIdStore};
use viewmesh_view::{ViewManager, ViewStatus};

/// Wire form of a tracked view's status, carried in `TrackView` payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackedView {
    /// Still running
    Running,
    /// Finished with output
    Succeeded(Vec<u8>),
    /// Finished with an error message
    Failed(String),
}

impl From<ViewStatus> for TrackedView {
    fn from(status: ViewStatus) -> Self {
        match status {
            ViewStatus::Running => Self::Running,
            ViewStatus::Succeeded(output) => Self::Succeeded(output),
            ViewStatus::Failed(message) => Self::Failed(message),
        }
    }
}

impl TrackedView {
    /// Encode as a `TrackView` payload
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a `TrackView` payload
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        bincode::deserialize(payload)
            .map_err(|e| ViewMeshError::protocol(format!("malformed view status: {e}")))
    }
}

/// Serves view commands from a [`ViewManager`] and finality queries from a
/// [`TxIdStore`]
pub struct NodeCommandHandler {
    manager: ViewManager,
    store: Arc<TxIdStore>,
    config: NodeConfig,
}

impl NodeCommandHandler {
    /// Create a handler
    pub fn new(manager: ViewManager, store: Arc<TxIdStore>, config: NodeConfig) -> Self {
        Self {
            manager,
            store,
            config,
        }
    }

    /// Scan forward from the cursor position for the txid with digest `hash`
    fn find_by_hash(cursor: &mut TxIdIterator, hash: &[u8]) -> Result<Option<String>> {
        while let Some(entry) = cursor.next()? {
            if sha256(entry.txid.as_bytes()) == hash {
                return Ok(Some(entry.txid));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl CommandHandler for NodeCommandHandler {
    async fn initiate_view(&self, fid: &str, input: &[u8]) -> Result<String> {
        let view = self.manager.new_view(fid, input)?;
        let cid = self.manager.initiate_view_async(view);
        info!(fid = %fid, context_id = %cid, "view initiated");
        Ok(cid)
    }

    async fn track_view(&self, cid: &str) -> Result<Vec<u8>> {
        TrackedView::from(self.manager.track(cid)?).to_payload()
    }

    async fn call_view(&self, fid: &str, input: &[u8]) -> Result<Vec<u8>> {
        debug!(fid = %fid, "calling view");
        self.manager.call_view(fid, input).await
    }

    async fn is_tx_final(&self, txid: &str) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.config.finality_timeout();
        loop {
            match self.store.get(txid)? {
                ValidationCode::Valid => {
                    debug!(txid = %txid, "transaction is final and valid");
                    return Ok(Vec::new());
                }
                ValidationCode::Invalid => {
                    debug!(txid = %txid, "transaction is final and invalid");
                    return Ok(format!("transaction [{txid}] is not valid").into_bytes());
                }
                code => {
                    if Instant::now() >= deadline {
                        warn!(txid = %txid, code = %code, "finality wait timed out");
                        return Ok(format!("transaction [{txid}] is not final yet").into_bytes());
                    }
                    debug!(txid = %txid, code = %code, "transaction not final, waiting");
                }
            }
            // Never sleep past the deadline
            let left = deadline.saturating_duration_since(Instant::now());
            sleep(self.config.poll_interval().min(left)).await;
        }
    }

    async fn is_hash_final(&self, hash: &[u8], frames: mpsc::Sender<HashFinality>) -> Result<()> {
        let hash_hex = hex::encode(hash);
        let deadline = Instant::now() + self.config.finality_timeout();
        let mut cursor = self.store.iterator(SeekPosition::Start)?;
        let mut matched: Option<String> = None;

        let outcome = loop {
            if matched.is_none() {
                matched = Self::find_by_hash(&mut cursor, hash)?;
                if let Some(txid) = &matched {
                    debug!(hash = %hash_hex, txid = %txid, "hash resolved to transaction");
                }
            }
            if let Some(txid) = &matched {
                let code = self.store.get(txid)?;
                if code.is_final() {
                    let last = HashFinality {
                        belief: code == ValidationCode::Valid,
                        is_final: true,
                    };
                    // A consumer that left early gets no final frame
                    let _ = frames.send(last).await;
                    break Ok(());
                }
            }

            let pending = HashFinality {
                belief: false,
                is_final: false,
            };
            if frames.send(pending).await.is_err() {
                debug!(hash = %hash_hex, "finality subscriber went away");
                break Ok(());
            }
            if Instant::now() >= deadline {
                warn!(hash = %hash_hex, "hash finality wait timed out");
                break Err(ViewMeshError::timeout(format!(
                    "transaction with hash [{hash_hex}] is not final yet"
                )));
            }
            let left = deadline.saturating_duration_since(Instant::now());
            sleep(self.config.poll_interval().min(left)).await;
        };
        cursor.close();
        outcome
    }
}
