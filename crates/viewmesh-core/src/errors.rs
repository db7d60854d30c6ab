//! Unified error system for viewmesh
//!
//! A single error type shared by the context, the store, and the command
//! protocol. Each variant carries a human readable message that names the
//! operation and the identifier involved, so failures can be diagnosed
//! without a stack trace.

use serde::{Deserialize, Serialize};

/// Unified error type for all viewmesh operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ViewMeshError {
    /// Invalid input or configuration
    #[error("Invalid: {message}")]
    Invalid {
        /// Error message describing the invalid input
        message: String,
    },

    /// Resource not found
    #[error("Not found: {message}")]
    NotFound {
        /// Error message describing what was not found
        message: String,
    },

    /// An identity could not be mapped to endpoints or key material
    #[error("Resolution error: {message}")]
    Resolution {
        /// Error message naming the party that failed to resolve
        message: String,
    },

    /// A session could not be established or used
    #[error("Session error: {message}")]
    Session {
        /// Error message describing the session failure
        message: String,
    },

    /// A view faulted while running and the fault was captured
    #[error("Execution aborted: {payload}")]
    ExecutionAborted {
        /// Captured fault payload
        payload: String,
    },

    /// Malformed, unexpected, or server-reported protocol failure
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message describing the protocol failure
        message: String,
    },

    /// Network or transport error
    #[error("Network error: {message}")]
    Network {
        /// Error message describing the network issue
        message: String,
    },

    /// An operation did not complete within its deadline
    #[error("Timeout: {message}")]
    Timeout {
        /// Error message naming the operation that timed out
        message: String,
    },

    /// Cryptographic operation failed
    #[error("Crypto error: {message}")]
    Crypto {
        /// Error message describing the cryptographic failure
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message describing the serialization failure
        message: String,
    },

    /// Storage operation failed
    #[error("Storage error: {message}")]
    Storage {
        /// Error message describing the storage failure
        message: String,
    },

    /// Internal system error
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal error
        message: String,
    },
}

impl ViewMeshError {
    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a resolution error
    pub fn resolution(message: impl Into<String>) -> Self {
        Self::Resolution {
            message: message.into(),
        }
    }

    /// Create a session error
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    /// Create an execution aborted error from a captured fault payload
    pub fn execution_aborted(payload: impl Into<String>) -> Self {
        Self::ExecutionAborted {
            payload: payload.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a crypto error
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Prefix the message with the operation that failed, keeping the variant
    pub fn context(self, operation: impl std::fmt::Display) -> Self {
        let wrap = |message: String| format!("{operation}: {message}");
        match self {
            Self::Invalid { message } => Self::Invalid {
                message: wrap(message),
            },
            Self::NotFound { message } => Self::NotFound {
                message: wrap(message),
            },
            Self::Resolution { message } => Self::Resolution {
                message: wrap(message),
            },
            Self::Session { message } => Self::Session {
                message: wrap(message),
            },
            Self::ExecutionAborted { payload } => Self::ExecutionAborted {
                payload: wrap(payload),
            },
            Self::Protocol { message } => Self::Protocol {
                message: wrap(message),
            },
            Self::Network { message } => Self::Network {
                message: wrap(message),
            },
            Self::Timeout { message } => Self::Timeout {
                message: wrap(message),
            },
            Self::Crypto { message } => Self::Crypto {
                message: wrap(message),
            },
            Self::Serialization { message } => Self::Serialization {
                message: wrap(message),
            },
            Self::Storage { message } => Self::Storage {
                message: wrap(message),
            },
            Self::Internal { message } => Self::Internal {
                message: wrap(message),
            },
        }
    }

    /// The bare message without the category prefix
    pub fn message(&self) -> &str {
        match self {
            Self::ExecutionAborted { payload } => payload,
            Self::Invalid { message }
            | Self::NotFound { message }
            | Self::Resolution { message }
            | Self::Session { message }
            | Self::Protocol { message }
            | Self::Network { message }
            | Self::Timeout { message }
            | Self::Crypto { message }
            | Self::Serialization { message }
            | Self::Storage { message }
            | Self::Internal { message } => message,
        }
    }
}

/// Standard Result type for viewmesh operations
pub type Result<T> = std::result::Result<T, ViewMeshError>;

impl From<std::io::Error> for ViewMeshError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            std::io::ErrorKind::TimedOut => Self::timeout(err.to_string()),
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => Self::network(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

impl From<bincode::Error> for ViewMeshError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ViewMeshError {
    fn from(err: toml::de::Error) -> Self {
        Self::invalid(format!("malformed configuration: {err}"))
    }
}

impl From<toml::ser::Error> for ViewMeshError {
    fn from(err: toml::ser::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ViewMeshError::invalid("test message");
        assert!(matches!(err, ViewMeshError::Invalid { .. }));
        assert_eq!(err.to_string(), "Invalid: test message");
    }

    #[test]
    fn test_context_keeps_variant() {
        let err = ViewMeshError::resolution("party [abc] unknown").context("get session");
        assert!(matches!(err, ViewMeshError::Resolution { .. }));
        assert_eq!(err.message(), "get session: party [abc] unknown");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = ViewMeshError::from(io_err);
        assert!(matches!(err, ViewMeshError::NotFound { .. }));

        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            ViewMeshError::from(io_err),
            ViewMeshError::Network { .. }
        ));
    }
}
