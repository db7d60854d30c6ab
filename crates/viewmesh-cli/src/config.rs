//! CLI configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use viewmesh_core::Ed25519SigningIdentity;
use viewmesh_node::NodeConfig;
use viewmesh_rpc::{load_config, ClientConfig, ViewClient};

/// Contents of `--config`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// How to reach the node
    pub client: ClientConfig,
    /// Hex Ed25519 secret key file, relative to the config file
    pub signing_key: PathBuf,
    /// Settings used by `viewmesh node`
    pub node: NodeConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            signing_key: PathBuf::from("signing.key"),
            node: NodeConfig::default(),
        }
    }
}

impl CliConfig {
    /// Load `path`, falling back to defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            load_config::<Self>(path)
                .with_context(|| format!("loading {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        if config.signing_key.is_relative() {
            if let Some(dir) = path.parent() {
                config.signing_key = dir.join(&config.signing_key);
            }
        }
        Ok(config)
    }

    /// Read the signing key
    pub fn signer(&self) -> Result<Ed25519SigningIdentity> {
        let text = std::fs::read_to_string(&self.signing_key).with_context(|| {
            format!(
                "reading signing key {} (create one with `viewmesh keygen`)",
                self.signing_key.display()
            )
        })?;
        Ok(Ed25519SigningIdentity::from_hex(text.trim())?)
    }

    /// RPC client signing with the configured key
    pub fn client(&self) -> Result<ViewClient> {
        let signer = Arc::new(self.signer()?);
        Ok(ViewClient::from_config(&self.client, signer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults_next_to_it() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.client, ClientConfig::default());
        assert_eq!(config.signing_key, dir.path().join("signing.key"));
    }

    #[test]
    fn test_signing_key_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let key = Ed25519SigningIdentity::generate();
        std::fs::write(dir.path().join("node.key"), format!("{}\n", key.to_hex())).unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "signing_key = \"node.key\"\n[client]\naddress = \"127.0.0.1:9999\"\n",
        )
        .unwrap();

        let config = CliConfig::load(&path).unwrap();
        assert_eq!(config.client.address, "127.0.0.1:9999");
        assert_eq!(config.signer().unwrap().identity(), key.identity());
    }
}
