use fleet_communicator::{CommunicatorError, CommunicatorErrorKind};
use fleet_lease::FencingToken;
use fleet_state::NodeId;
use thiserror::Error;

/// Errors returned by simulated nodes.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// No simulated node with this id.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// The node is partitioned away.
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    /// The node's simulated latency exceeded the caller's timeout.
    #[error("node {0} timed out")]
    TimedOut(NodeId),

    /// The node has already accepted a newer fencing token.
    #[error("node {node} rejected token {token}, already saw {seen}")]
    StaleToken {
        /// Rejecting node.
        node: NodeId,
        /// Token that came with the bundle.
        token: FencingToken,
        /// Newest token the node has accepted.
        seen: FencingToken,
    },

    /// The bundle's version is below what the node has acknowledged.
    #[error("node {node} rejected version {version}, already at {acked}")]
    StaleVersion {
        /// Rejecting node.
        node: NodeId,
        /// Version that came with the bundle.
        version: u64,
        /// Version the node has acknowledged.
        acked: u64,
    },
}

impl CommunicatorError for Error {
    fn kind(&self) -> CommunicatorErrorKind {
        match self {
            Self::UnknownNode(_) | Self::Unreachable(_) => CommunicatorErrorKind::Unreachable,
            Self::TimedOut(_) => CommunicatorErrorKind::Timeout,
            Self::StaleToken { .. } | Self::StaleVersion { .. } => CommunicatorErrorKind::Rejected,
        }
    }
}
