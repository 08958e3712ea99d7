//! Node health tracking

mod record;
mod tracker;

pub use record::NodeHealthRecord;
pub use tracker::NodeStateTracker;

use std::collections::BTreeMap;

use fleet_state::{NodeId, ResourceUsage, WireState};
use serde::{Deserialize, Serialize};

/// Read-only view of one node's record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeStateView {
    /// The node.
    pub node: NodeId,
    /// Latest reported state.
    pub reported: WireState,
    /// Reported state after hysteresis.
    pub effective: WireState,
    /// Operator override.
    pub wanted: Option<WireState>,
    /// State published for the node.
    pub resolved: WireState,
    /// Failed pings since the last report.
    pub consecutive_failures: u32,
    /// When the node last reported.
    pub last_reported_at_ms: Option<u64>,
    /// Latest resource usage.
    pub resource_usage: ResourceUsage,
    /// Highest version the node acknowledged.
    pub acked_version: u64,
}

impl NodeStateView {
    fn new(node: NodeId, record: &NodeHealthRecord) -> Self {
        Self {
            node,
            reported: record.reported_state(),
            effective: record.effective_state(),
            wanted: record.wanted_state(),
            resolved: record.resolved_state(),
            consecutive_failures: record.consecutive_failures(),
            last_reported_at_ms: record.last_reported_at_ms(),
            resource_usage: record.resource_usage().clone(),
            acked_version: record.acked_version(),
        }
    }
}

/// Immutable copy of the tracker, handed to derivation and to status readers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeStateSnapshot {
    nodes: BTreeMap<NodeId, NodeStateView>,
}

impl NodeStateSnapshot {
    /// View of one node.
    #[must_use]
    pub fn get(&self, node: &NodeId) -> Option<&NodeStateView> {
        self.nodes.get(node)
    }

    /// Published state of a node, `Down` for unknown nodes.
    #[must_use]
    pub fn resolved_state(&self, node: &NodeId) -> WireState {
        self.nodes
            .get(node)
            .map_or(WireState::Down, |view| view.resolved)
    }

    /// Every node view, in node order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeStateView> {
        self.nodes.values()
    }

    /// Number of tracked nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no nodes are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
