//! Node configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use viewmesh_core::{Result, ViewMeshError};
use viewmesh_rpc::{load_config, ServerConfig};

/// Settings of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// `host:port` the command server binds to
    pub listen_address: String,
    /// Snapshot file of the transaction index; in-memory when unset
    pub store_path: Option<PathBuf>,
    /// How long a finality query waits for a final code
    pub finality_timeout_ms: u64,
    /// Delay between two store lookups of a finality query
    pub finality_poll_interval_ms: u64,
    /// Command validation settings
    pub server: ServerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:7051".to_string(),
            store_path: None,
            finality_timeout_ms: 30_000,
            finality_poll_interval_ms: 100,
            server: ServerConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Read and validate a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject unusable settings
    pub fn validate(&self) -> Result<()> {
        if self.listen_address.trim().is_empty() {
            return Err(ViewMeshError::invalid("listen_address must not be empty"));
        }
        if self.finality_poll_interval_ms == 0 {
            return Err(ViewMeshError::invalid(
                "finality_poll_interval_ms must be positive",
            ));
        }
        if self.finality_timeout_ms < self.finality_poll_interval_ms {
            return Err(ViewMeshError::invalid(
                "finality_timeout_ms must not be shorter than finality_poll_interval_ms",
            ));
        }
        self.server.validate()
    }

    pub(crate) fn finality_timeout(&self) -> Duration {
        Duration::from_millis(self.finality_timeout_ms)
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.finality_poll_interval_ms)
    }
}
