//! Protocol revisions.
//!
//! The engine layer has shipped two wire-incompatible revisions. They differ
//! in who drives the heartbeat and in how binary frames are marked.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default protocol revision.
pub const PROTOCOL_REVISION: Revision = Revision::V4;

/// Engine protocol revision, sent as the `EIO` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Revision {
    /// Client pings, server pongs. Binary frames carry a leading type byte.
    V3 = 3,
    /// Server pings, client pongs. Binary frames are raw.
    V4 = 4,
}

impl Revision {
    /// Value of the `EIO` query parameter.
    #[must_use]
    pub const fn number(self) -> u8 {
        self as u8
    }

    /// Whether the server initiates the heartbeat.
    #[must_use]
    pub const fn server_pings(self) -> bool {
        matches!(self, Revision::V4)
    }

    /// Whether binary frames are prefixed with the message frame byte.
    #[must_use]
    pub const fn prefixes_binary(self) -> bool {
        matches!(self, Revision::V3)
    }

    /// Whether the default namespace needs an explicit connect packet.
    #[must_use]
    pub const fn connects_default_namespace(self) -> bool {
        matches!(self, Revision::V4)
    }
}

impl From<Revision> for u8 {
    fn from(rev: Revision) -> u8 {
        rev as u8
    }
}

impl TryFrom<u8> for Revision {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            3 => Ok(Revision::V3),
            4 => Ok(Revision::V4),
            _ => Err("Unsupported protocol revision"),
        }
    }
}

impl FromStr for Revision {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u8>()
            .map_err(|_| "Invalid protocol revision")
            .and_then(Revision::try_from)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

impl Default for Revision {
    fn default() -> Self {
        PROTOCOL_REVISION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_traits() {
        assert!(Revision::V4.server_pings());
        assert!(!Revision::V3.server_pings());
        assert!(Revision::V3.prefixes_binary());
        assert!(!Revision::V4.prefixes_binary());
    }

    #[test]
    fn test_revision_parse() {
        assert_eq!("4".parse::<Revision>(), Ok(Revision::V4));
        assert_eq!(Revision::try_from(3), Ok(Revision::V3));
        assert!("5".parse::<Revision>().is_err());
        assert!("x".parse::<Revision>().is_err());
    }

    #[test]
    fn test_revision_display() {
        assert_eq!(Revision::default().to_string(), "4");
    }
}
