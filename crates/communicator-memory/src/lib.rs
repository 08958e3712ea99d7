//! In-memory node communicator for testing
//!
//! Nodes are simulated inside the process. Each one keeps the newest fencing token and
//! the highest version it has accepted and rejects anything older, the same way real
//! distributors and storage nodes guard against deposed masters.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_communicator::{Ack, NodeCommunicator, NodeReport};
use fleet_lease::FencingToken;
use fleet_state::{ClusterStateBundle, NodeId, ResourceUsage, WireState};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct SimulatedNode {
    state: WireState,
    resource_usage: ResourceUsage,
    acked_version: u64,
    newest_token: Option<FencingToken>,
    reachable: bool,
    latency: Duration,
    received_versions: Vec<u64>,
    last_bundle: Option<Arc<ClusterStateBundle>>,
}

impl SimulatedNode {
    fn new(state: WireState) -> Self {
        Self {
            state,
            resource_usage: ResourceUsage::new(),
            acked_version: 0,
            newest_token: None,
            reachable: true,
            latency: Duration::ZERO,
            received_versions: Vec::new(),
            last_bundle: None,
        }
    }
}

/// Simulated cluster of nodes reachable through [`NodeCommunicator`].
#[derive(Clone, Debug, Default)]
pub struct MemoryCommunicator {
    nodes: Arc<Mutex<HashMap<NodeId, SimulatedNode>>>,
}

impl MemoryCommunicator {
    /// Creates a communicator with no nodes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a communicator with every given node up.
    pub async fn with_nodes(nodes: impl IntoIterator<Item = NodeId> + Send) -> Self {
        let communicator = Self::new();
        for node in nodes {
            communicator.add_node(node, WireState::Up).await;
        }
        communicator
    }

    /// Adds (or resets) a simulated node.
    pub async fn add_node(&self, node: NodeId, state: WireState) {
        self.nodes.lock().await.insert(node, SimulatedNode::new(state));
    }

    /// Changes the state the node reports about itself.
    pub async fn set_state(&self, node: NodeId, state: WireState) {
        self.with_node(node, |sim| sim.state = state).await;
    }

    /// Sets one resource usage fraction reported by the node.
    pub async fn set_resource_usage(&self, node: NodeId, resource: &str, usage: f64) {
        self.with_node(node, |sim| {
            sim.resource_usage.insert(resource.to_string(), usage);
        })
        .await;
    }

    /// Partitions the node away, or heals it.
    pub async fn set_reachable(&self, node: NodeId, reachable: bool) {
        self.with_node(node, |sim| sim.reachable = reachable).await;
    }

    /// Makes every RPC to the node take `latency`.
    pub async fn set_latency(&self, node: NodeId, latency: Duration) {
        self.with_node(node, |sim| sim.latency = latency).await;
    }

    /// Pretends the node already acknowledged `version`, for example from an earlier master.
    pub async fn set_acked_version(&self, node: NodeId, version: u64) {
        self.with_node(node, |sim| sim.acked_version = version).await;
    }

    /// Highest version the node has acknowledged.
    pub async fn acked_version(&self, node: NodeId) -> Option<u64> {
        self.nodes.lock().await.get(&node).map(|sim| sim.acked_version)
    }

    /// Every version the node accepted, in delivery order.
    pub async fn received_versions(&self, node: NodeId) -> Vec<u64> {
        self.nodes
            .lock()
            .await
            .get(&node)
            .map(|sim| sim.received_versions.clone())
            .unwrap_or_default()
    }

    /// The last bundle the node accepted.
    pub async fn last_bundle(&self, node: NodeId) -> Option<Arc<ClusterStateBundle>> {
        self.nodes
            .lock()
            .await
            .get(&node)
            .and_then(|sim| sim.last_bundle.clone())
    }

    /// Total number of bundles accepted across all nodes.
    pub async fn delivery_count(&self) -> usize {
        self.nodes
            .lock()
            .await
            .values()
            .map(|sim| sim.received_versions.len())
            .sum()
    }

    async fn with_node(&self, node: NodeId, f: impl FnOnce(&mut SimulatedNode) + Send) {
        if let Some(sim) = self.nodes.lock().await.get_mut(&node) {
            f(sim);
        }
    }

    /// Checks reachability and waits out the node's latency, without holding the lock
    /// while sleeping.
    async fn round_trip(&self, node: NodeId, timeout: Duration) -> Result<(), Error> {
        let latency = {
            let nodes = self.nodes.lock().await;
            let sim = nodes.get(&node).ok_or(Error::UnknownNode(node))?;
            if !sim.reachable {
                return Err(Error::Unreachable(node));
            }
            sim.latency
        };

        if latency > timeout {
            tokio::time::sleep(timeout).await;
            return Err(Error::TimedOut(node));
        }

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        Ok(())
    }
}

#[async_trait]
impl NodeCommunicator for MemoryCommunicator {
    type Error = Error;

    async fn ping(&self, node: NodeId, timeout: Duration) -> Result<NodeReport, Self::Error> {
        self.round_trip(node, timeout).await?;

        let nodes = self.nodes.lock().await;
        let sim = nodes.get(&node).ok_or(Error::UnknownNode(node))?;

        Ok(NodeReport {
            state: sim.state,
            resource_usage: sim.resource_usage.clone(),
            acked_version: sim.acked_version,
        })
    }

    async fn send_bundle(
        &self,
        node: NodeId,
        bundle: Arc<ClusterStateBundle>,
        token: FencingToken,
        timeout: Duration,
    ) -> Result<Ack, Self::Error> {
        self.round_trip(node, timeout).await?;

        let mut nodes = self.nodes.lock().await;
        let sim = nodes.get_mut(&node).ok_or(Error::UnknownNode(node))?;

        if let Some(seen) = sim.newest_token {
            if token < seen {
                return Err(Error::StaleToken { node, token, seen });
            }
        }

        let version = bundle.version();
        if version < sim.acked_version {
            return Err(Error::StaleVersion {
                node,
                version,
                acked: sim.acked_version,
            });
        }

        debug!(%node, version, %token, "bundle accepted");

        sim.newest_token = Some(token);
        sim.acked_version = version;
        sim.received_versions.push(version);
        sim.last_bundle = Some(bundle);

        Ok(Ack { node, version })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use fleet_communicator::{CommunicatorError, CommunicatorErrorKind, RpcError};
    use fleet_state::ClusterState;

    fn bundle(version: u64) -> Arc<ClusterStateBundle> {
        Arc::new(ClusterStateBundle::baseline_only(ClusterState::new(version)))
    }

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_ping_reports_state_and_usage() {
        let node = NodeId::storage(0);
        let communicator = MemoryCommunicator::with_nodes([node]).await;
        communicator.set_resource_usage(node, "disk", 0.5).await;
        communicator.set_acked_version(node, 4).await;

        let report = communicator.ping(node, TIMEOUT).await.unwrap();
        assert_eq!(report.state, WireState::Up);
        assert_eq!(report.resource_usage.get("disk"), Some(&0.5));
        assert_eq!(report.acked_version, 4);
    }

    #[tokio::test]
    async fn test_stale_token_and_version_rejected() {
        let node = NodeId::distributor(0);
        let communicator = MemoryCommunicator::with_nodes([node]).await;

        let new_token = FencingToken::new(1, 5);
        let old_token = FencingToken::new(0, 4);

        communicator
            .send_bundle(node, bundle(3), new_token, TIMEOUT)
            .await
            .unwrap();

        let err = communicator
            .send_bundle(node, bundle(4), old_token, TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), CommunicatorErrorKind::Rejected);
        assert_matches!(err, Error::StaleToken { .. });

        assert_matches!(
            communicator.send_bundle(node, bundle(2), new_token, TIMEOUT).await,
            Err(Error::StaleVersion { version: 2, acked: 3, .. })
        );

        assert_eq!(communicator.received_versions(node).await, vec![3]);
    }

    #[tokio::test]
    async fn test_unreachable_node() {
        let node = NodeId::storage(2);
        let communicator = MemoryCommunicator::with_nodes([node]).await;
        communicator.set_reachable(node, false).await;

        let err = communicator.ping(node, TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), CommunicatorErrorKind::Unreachable);

        assert_matches!(
            communicator.ping(NodeId::storage(9), TIMEOUT).await,
            Err(Error::UnknownNode(_))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_isolates_slow_nodes() {
        let fast = NodeId::storage(0);
        let slow = NodeId::storage(1);
        let communicator = MemoryCommunicator::with_nodes([fast, slow]).await;
        communicator.set_latency(slow, Duration::from_secs(30)).await;

        let results = communicator
            .publish(&[fast, slow], bundle(1), FencingToken::new(0, 1), TIMEOUT)
            .await;

        assert_matches!(results[&fast], Ok(Ack { version: 1, .. }));
        let err = results[&slow].as_ref().unwrap_err();
        assert_eq!(err.kind(), CommunicatorErrorKind::Timeout);
        assert_eq!(communicator.acked_version(slow).await, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_with_deadline() {
        let node = NodeId::storage(0);
        let communicator = MemoryCommunicator::with_nodes([node]).await;
        communicator.set_latency(node, Duration::from_millis(200)).await;

        assert!(communicator.ping_with_deadline(node, TIMEOUT).await.is_ok());
        assert_matches!(
            communicator
                .ping_with_deadline(node, Duration::from_millis(100))
                .await,
            Err(RpcError::TimedOut(_) | RpcError::Node(Error::TimedOut(_)))
        );
    }
}
