//! Node identity types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StateParseError;

/// Role of a content node.
///
/// Distributors order before storage nodes, which is also the order node sections appear
/// in the wire format.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Distributor node, owns bucket routing.
    Distributor,

    /// Storage node, holds bucket replicas.
    Storage,
}

impl NodeType {
    /// All node types in wire order.
    pub const ALL: [Self; 2] = [Self::Distributor, Self::Storage];

    /// Name used in the wire format and in node ids.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Distributor => "distributor",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = StateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "distributor" => Ok(Self::Distributor),
            "storage" => Ok(Self::Storage),
            other => Err(StateParseError::UnknownNodeType(other.to_string())),
        }
    }
}

/// Identity of a distributor or storage node.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct NodeId {
    node_type: NodeType,
    index: u16,
}

impl NodeId {
    /// Creates a node id.
    #[must_use]
    pub const fn new(node_type: NodeType, index: u16) -> Self {
        Self { node_type, index }
    }

    /// Shorthand for a storage node id.
    #[must_use]
    pub const fn storage(index: u16) -> Self {
        Self::new(NodeType::Storage, index)
    }

    /// Shorthand for a distributor node id.
    #[must_use]
    pub const fn distributor(index: u16) -> Self {
        Self::new(NodeType::Distributor, index)
    }

    /// The node's role.
    #[must_use]
    pub const fn node_type(&self) -> NodeType {
        self.node_type
    }

    /// The node's index within its role.
    #[must_use]
    pub const fn index(&self) -> u16 {
        self.index
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_type, self.index)
    }
}

impl FromStr for NodeId {
    type Err = StateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node_type, index) = s
            .split_once('.')
            .ok_or_else(|| StateParseError::InvalidNodeId(s.to_string()))?;
        let index = index
            .parse()
            .map_err(|_| StateParseError::InvalidNodeId(s.to_string()))?;

        Ok(Self::new(node_type.parse()?, index))
    }
}
