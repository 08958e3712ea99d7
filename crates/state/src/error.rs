//! Error types for cluster state values

use thiserror::Error;

/// Errors produced while parsing the cluster state wire format or node ids.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum StateParseError {
    /// The string had no `version:` token.
    #[error("missing version token")]
    MissingVersion,

    /// A token did not have the `key:value` shape.
    #[error("malformed token '{0}'")]
    MalformedToken(String),

    /// A top-level key is not part of the format.
    #[error("unknown key '{0}'")]
    UnknownKey(String),

    /// A numeric value could not be parsed.
    #[error("invalid number in token '{0}'")]
    InvalidNumber(String),

    /// A state code is not one of `u d m r i s`.
    #[error("unknown state code '{0}'")]
    UnknownStateCode(String),

    /// A node type name is not `distributor` or `storage`.
    #[error("unknown node type '{0}'")]
    UnknownNodeType(String),

    /// A node id string was not `<type>.<index>`.
    #[error("invalid node id '{0}'")]
    InvalidNodeId(String),

    /// A per-node token appeared before any node section.
    #[error("node token '{0}' appears before a node section")]
    NodeTokenWithoutSection(String),

    /// A per-node token referenced an index outside the section's node count.
    #[error("node index {index} out of range for {section} count {count}")]
    IndexOutOfRange {
        /// Section name.
        section: String,
        /// Offending index.
        index: u16,
        /// Declared node count.
        count: u16,
    },

    /// A key appeared twice.
    #[error("duplicate key '{0}'")]
    DuplicateKey(String),
}

/// Errors produced when assembling a bundle.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum BundleError {
    /// A derived space carries a different version than the baseline.
    #[error("bucket space '{space}' has version {found}, baseline has {expected}")]
    VersionMismatch {
        /// Offending bucket space.
        space: String,
        /// Baseline version.
        expected: u64,
        /// Derived space version.
        found: u64,
    },

    /// A derived space used the reserved baseline name.
    #[error("bucket space name '{0}' is reserved")]
    ReservedSpaceName(String),
}

