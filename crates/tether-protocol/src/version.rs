//! Wire protocol versioning.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Version carried by every client message, written as "major.minor".
///
/// Peers interoperate when their major versions agree; minor bumps only
/// add optional fields or message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Version spoken by this build.
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Accepts a peer's version or explains why it cannot be served.
    ///
    /// # Errors
    ///
    /// Returns `VersionError::Incompatible` when the major versions differ.
    pub fn check(&self, peer: &ProtocolVersion) -> Result<(), VersionError> {
        if self.major == peer.major {
            Ok(())
        } else {
            Err(VersionError::Incompatible {
                got: peer.to_string(),
                expected: self.to_string(),
            })
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl FromStr for ProtocolVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionError::InvalidFormat(s.to_string());
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid version format: {0}")]
    InvalidFormat(String),

    #[error("incompatible protocol version {got}, daemon speaks {expected}")]
    Incompatible { got: String, expected: String },
}
