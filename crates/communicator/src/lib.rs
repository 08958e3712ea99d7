//! Abstract interface for talking to distributor and storage nodes.
//!
//! The controller only ever needs two RPCs: a health ping that also tells which cluster
//! state version the node has acknowledged, and delivery of a state bundle tagged with the
//! master's fencing token.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod error;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_lease::FencingToken;
use fleet_state::{ClusterStateBundle, NodeId, ResourceUsage, WireState};
use futures::future::join_all;

pub use error::{CommunicatorError, CommunicatorErrorKind, RpcError};

/// What a node says about itself when pinged.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeReport {
    /// The node's own view of its state.
    pub state: WireState,

    /// Resource usage fractions.
    pub resource_usage: ResourceUsage,

    /// Highest cluster state version the node has acknowledged, 0 if none.
    pub acked_version: u64,
}

/// Acknowledgement of a delivered bundle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ack {
    /// Acknowledging node.
    pub node: NodeId,

    /// Version the node now has.
    pub version: u64,
}

/// Result of delivering one bundle to one node.
pub type Delivery<E> = Result<Ack, RpcError<E>>;

/// Pings nodes and delivers cluster state bundles to them.
///
/// Nodes are expected to reject bundles carrying a fencing token older than one they have
/// already accepted, and bundles whose version is below the one they have acknowledged.
#[async_trait]
pub trait NodeCommunicator: Clone + Send + Sync + 'static {
    /// The error type for node RPCs.
    type Error: CommunicatorError;

    /// Asks a node for its state. Implementations should give up after `timeout`.
    async fn ping(&self, node: NodeId, timeout: Duration) -> Result<NodeReport, Self::Error>;

    /// Delivers a bundle to a node. Implementations should give up after `timeout`.
    async fn send_bundle(
        &self,
        node: NodeId,
        bundle: Arc<ClusterStateBundle>,
        token: FencingToken,
        timeout: Duration,
    ) -> Result<Ack, Self::Error>;

    /// Pings a node, enforcing `timeout` regardless of how the implementation behaves.
    async fn ping_with_deadline(
        &self,
        node: NodeId,
        timeout: Duration,
    ) -> Result<NodeReport, RpcError<Self::Error>> {
        match tokio::time::timeout(timeout, self.ping(node, timeout)).await {
            Ok(result) => result.map_err(RpcError::Node),
            Err(_) => Err(RpcError::TimedOut(timeout)),
        }
    }

    /// Delivers `bundle` to every node concurrently, each with its own deadline. A slow
    /// or failing node does not hold up the others.
    async fn publish(
        &self,
        nodes: &[NodeId],
        bundle: Arc<ClusterStateBundle>,
        token: FencingToken,
        timeout: Duration,
    ) -> BTreeMap<NodeId, Delivery<Self::Error>> {
        let sends = nodes.iter().map(|&node| {
            let bundle = bundle.clone();
            async move {
                let result = match tokio::time::timeout(
                    timeout,
                    self.send_bundle(node, bundle, token, timeout),
                )
                .await
                {
                    Ok(result) => result.map_err(RpcError::Node),
                    Err(_) => Err(RpcError::TimedOut(timeout)),
                };
                (node, result)
            }
        });

        join_all(sends).await.into_iter().collect()
    }
}
