//! Node states as they appear on the wire

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StateParseError;

/// State of a single node, either as reported by the node itself or as decided by the
/// controller.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireState {
    /// Serving normally.
    Up,

    /// Not serving. Also inferred when a node stops answering pings.
    Down,

    /// Temporarily out of service, data kept.
    Maintenance,

    /// Serving, but data should be moved elsewhere.
    Retired,

    /// Starting up, may serve partially.
    Initializing,

    /// Shutting down.
    Stopping,
}

impl WireState {
    /// Every state, in code order.
    pub const ALL: [Self; 6] = [
        Self::Up,
        Self::Down,
        Self::Maintenance,
        Self::Retired,
        Self::Initializing,
        Self::Stopping,
    ];

    /// Single-letter code used in the cluster state string.
    #[must_use]
    pub const fn code(self) -> char {
        match self {
            Self::Up => 'u',
            Self::Down => 'd',
            Self::Maintenance => 'm',
            Self::Retired => 'r',
            Self::Initializing => 'i',
            Self::Stopping => 's',
        }
    }

    /// Parses a single-letter state code.
    ///
    /// # Errors
    ///
    /// Returns [`StateParseError::UnknownStateCode`] for anything but `u d m r i s`.
    pub fn from_code(code: &str) -> Result<Self, StateParseError> {
        match code {
            "u" => Ok(Self::Up),
            "d" => Ok(Self::Down),
            "m" => Ok(Self::Maintenance),
            "r" => Ok(Self::Retired),
            "i" => Ok(Self::Initializing),
            "s" => Ok(Self::Stopping),
            other => Err(StateParseError::UnknownStateCode(other.to_string())),
        }
    }

    /// Whether a node in this state can serve requests.
    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, Self::Up | Self::Retired | Self::Initializing)
    }

    /// Lowercase human readable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Maintenance => "maintenance",
            Self::Retired => "retired",
            Self::Initializing => "initializing",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for WireState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireState {
    type Err = StateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| StateParseError::UnknownStateCode(s.to_string()))
    }
}
