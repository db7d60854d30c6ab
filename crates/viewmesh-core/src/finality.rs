//! Finality status of tracked transactions

use crate::{Result, ViewMeshError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Recorded outcome of a transaction
///
/// New codes may be added as the committer learns to report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ValidationCode {
    /// Never recorded
    #[default]
    Unknown,
    /// Committed and valid
    Valid,
    /// Committed and invalid
    Invalid,
    /// Still being processed
    Busy,
    /// Waiting on other transactions
    HasDependencies,
}

impl ValidationCode {
    /// Compact persisted form
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Valid => 1,
            Self::Invalid => 2,
            Self::Busy => 3,
            Self::HasDependencies => 4,
        }
    }

    /// Decode the persisted form
    pub fn from_u8(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Valid),
            2 => Ok(Self::Invalid),
            3 => Ok(Self::Busy),
            4 => Ok(Self::HasDependencies),
            other => Err(ViewMeshError::serialization(format!(
                "unknown validation code {other}"
            ))),
        }
    }

    /// Whether the outcome can no longer change
    pub fn is_final(self) -> bool {
        matches!(self, Self::Valid | Self::Invalid)
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Busy => "busy",
            Self::HasDependencies => "has-dependencies",
        };
        f.write_str(name)
    }
}
