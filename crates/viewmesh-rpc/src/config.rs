//! Client, transport, and server configuration

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use viewmesh_core::{Result, ViewMeshError};

/// Default capacity of the `IsHashFinal` notification queue
pub const DEFAULT_STREAM_BUFFER: usize = 10;

/// Load a TOML configuration file
pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ViewMeshError::invalid(format!("read configuration {}: {e}", path.display()))
    })?;
    Ok(toml::from_str(&text)?)
}

/// Settings of the framed TCP transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Connection establishment deadline
    pub connect_timeout_ms: u64,
    /// Deadline for reading one unary frame
    pub read_timeout_ms: u64,
    /// Deadline for writing one frame
    pub write_timeout_ms: u64,
    /// Largest accepted frame body in bytes
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            read_timeout_ms: 30_000,
            write_timeout_ms: 30_000,
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl TransportConfig {
    /// Connect deadline as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Read deadline as a duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Write deadline as a duration
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Reject unusable settings
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 {
            return Err(ViewMeshError::invalid("connect_timeout_ms must be positive"));
        }
        if self.read_timeout_ms == 0 {
            return Err(ViewMeshError::invalid("read_timeout_ms must be positive"));
        }
        if self.write_timeout_ms == 0 {
            return Err(ViewMeshError::invalid("write_timeout_ms must be positive"));
        }
        if self.max_frame_size == 0 {
            return Err(ViewMeshError::invalid("max_frame_size must be positive"));
        }
        Ok(())
    }
}

/// How a client reaches a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port` of the node's command endpoint
    pub address: String,
    /// Connection establishment deadline
    pub connect_timeout_ms: u64,
    /// Deadline for a unary request
    pub request_timeout_ms: u64,
    /// Extra read time for a reply on top of `request_timeout_ms`, so a node
    /// that answers at the end of an equally long wait is still heard
    pub response_grace_ms: u64,
    /// Capacity of the `IsHashFinal` notification queue
    pub stream_buffer: usize,
    /// DER client certificate whose hash is bound into every command
    pub tls_client_cert: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7051".to_string(),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            response_grace_ms: 2_000,
            stream_buffer: DEFAULT_STREAM_BUFFER,
            tls_client_cert: None,
        }
    }
}

impl ClientConfig {
    /// Reject unusable settings
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(ViewMeshError::invalid("address must not be empty"));
        }
        if self.stream_buffer == 0 {
            return Err(ViewMeshError::invalid("stream_buffer must be positive"));
        }
        self.transport().validate()
    }

    /// Transport settings derived from the client deadlines
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            read_timeout_ms: self.request_timeout_ms.saturating_add(self.response_grace_ms),
            write_timeout_ms: self.request_timeout_ms,
            ..TransportConfig::default()
        }
    }

    /// Client certificate bytes, if configured
    pub fn load_certificate(&self) -> Result<Option<Vec<u8>>> {
        self.tls_client_cert
            .as_ref()
            .map(|path| {
                std::fs::read(path).map_err(|e| {
                    ViewMeshError::invalid(format!(
                        "read tls_client_cert {}: {e}",
                        path.display()
                    ))
                })
            })
            .transpose()
    }
}

/// Command validation settings of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Largest accepted distance between a command timestamp and local time
    pub max_clock_skew_secs: u64,
    /// Number of recent nonces remembered for replay detection
    pub nonce_cache_capacity: usize,
    /// Framing settings for accepted connections
    pub transport: TransportConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clock_skew_secs: 300,
            nonce_cache_capacity: 100_000,
            transport: TransportConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reject unusable settings
    pub fn validate(&self) -> Result<()> {
        if self.max_clock_skew_secs == 0 {
            return Err(ViewMeshError::invalid("max_clock_skew_secs must be positive"));
        }
        if self.nonce_cache_capacity == 0 {
            return Err(ViewMeshError::invalid("nonce_cache_capacity must be positive"));
        }
        self.transport.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config: ClientConfig = toml::from_str(r#"address = "10.0.0.1:9000""#).unwrap();
        assert_eq!(config.address, "10.0.0.1:9000");
        assert_eq!(config.stream_buffer, DEFAULT_STREAM_BUFFER);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_names_bad_field() {
        let config = ClientConfig {
            stream_buffer: 0,
            ..ClientConfig::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("stream_buffer"));

        let server = ServerConfig {
            nonce_cache_capacity: 0,
            ..ServerConfig::default()
        };
        assert!(server.validate().unwrap_err().to_string().contains("nonce_cache_capacity"));
    }

    #[test]
    fn test_reply_read_outlasts_request_timeout() {
        let config = ClientConfig {
            request_timeout_ms: 300,
            ..ClientConfig::default()
        };
        let transport = config.transport();
        assert_eq!(transport.write_timeout_ms, 300);
        assert_eq!(transport.read_timeout_ms, 2_300);
    }

    #[test]
    fn test_load_config_reports_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        assert!(load_config::<ClientConfig>(&path).is_err());

        std::fs::write(&path, "stream_buffer = \"many\"").unwrap();
        let err = load_config::<ClientConfig>(&path).unwrap_err();
        assert!(matches!(err, ViewMeshError::Invalid { .. }));
    }
}
