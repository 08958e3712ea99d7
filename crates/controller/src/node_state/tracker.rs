use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use fleet_state::{NodeId, ResourceUsage, WireState};
use tracing::{debug, info};

use super::record::NodeHealthRecord;
use super::{NodeStateSnapshot, NodeStateView};
use crate::options::FleetControllerOptions;

/// Per node health tracking with hysteresis.
///
/// Reports only change a node's effective state after the reported value has held for
/// `stable_state_time_period`. Any change of the reported value restarts that timer, so
/// a flapping node keeps its previous effective state.
#[derive(Debug)]
pub struct NodeStateTracker {
    records: BTreeMap<NodeId, NodeHealthRecord>,
    stable_period_ms: u64,
    ping_failure_threshold: u32,
}

impl NodeStateTracker {
    /// Creates records for `nodes`, all down.
    pub fn new(
        nodes: impl IntoIterator<Item = NodeId>,
        stable_state_time_period: Duration,
        ping_failure_threshold: u32,
        now_ms: u64,
    ) -> Self {
        Self {
            records: nodes
                .into_iter()
                .map(|node| (node, NodeHealthRecord::new(now_ms)))
                .collect(),
            stable_period_ms: u64::try_from(stable_state_time_period.as_millis())
                .unwrap_or(u64::MAX),
            ping_failure_threshold: ping_failure_threshold.max(1),
        }
    }

    /// Creates a tracker for the configured topology.
    #[must_use]
    pub fn from_options(options: &FleetControllerOptions, now_ms: u64) -> Self {
        Self::new(
            options.topology.nodes(),
            options.stable_state_time_period,
            options.ping_failure_threshold,
            now_ms,
        )
    }

    /// Records a state the node reported about itself. Resets its failure count.
    /// Reports older than the last accepted one are ignored.
    pub fn report_state(&mut self, node: NodeId, state: WireState, at_ms: u64) {
        let Some(record) = self.records.get_mut(&node) else {
            debug!(%node, "ignoring report for node outside topology");
            return;
        };

        if record.record_reported(state, at_ms) {
            record.consecutive_failures = 0;
        } else {
            debug!(%node, at_ms, "ignoring out of order report");
        }
    }

    /// Stores the node's latest resource usage.
    pub fn report_resource_usage(&mut self, node: NodeId, usage: ResourceUsage, at_ms: u64) {
        if let Some(record) = self.records.get_mut(&node) {
            if record.resource_usage_at_ms.is_none_or(|last| at_ms >= last) {
                record.resource_usage = usage;
                record.resource_usage_at_ms = Some(at_ms);
            }
        }
    }

    /// Remembers the highest version the node acknowledged.
    pub fn report_acked_version(&mut self, node: NodeId, version: u64) {
        if let Some(record) = self.records.get_mut(&node) {
            record.acked_version = record.acked_version.max(version);
        }
    }

    /// Counts a failed ping. After `ping_failure_threshold` consecutive failures the node
    /// is treated as having reported `Down` at `at_ms`.
    pub fn report_ping_failure(&mut self, node: NodeId, at_ms: u64) {
        let threshold = self.ping_failure_threshold;
        let Some(record) = self.records.get_mut(&node) else {
            return;
        };

        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        debug!(%node, failures = record.consecutive_failures, "ping failed");

        if record.consecutive_failures >= threshold {
            record.record_reported(WireState::Down, at_ms);
        }
    }

    /// Promotes reported states that have been stable long enough. Returns the nodes whose
    /// effective state changed.
    pub fn tick(&mut self, now_ms: u64) -> BTreeSet<NodeId> {
        let mut changed = BTreeSet::new();

        for (node, record) in &mut self.records {
            if let Some(previous) = record.stabilize(now_ms, self.stable_period_ms) {
                info!(
                    %node,
                    from = %previous,
                    to = %record.effective_state(),
                    "node state changed"
                );
                changed.insert(*node);
            }
        }

        changed
    }

    /// Sets or clears an operator override. Applies immediately, bypassing hysteresis.
    /// Returns whether anything changed.
    pub fn set_wanted_state(&mut self, node: NodeId, wanted: Option<WireState>) -> bool {
        let Some(record) = self.records.get_mut(&node) else {
            debug!(%node, "ignoring wanted state for node outside topology");
            return false;
        };

        if record.wanted_state == wanted {
            return false;
        }

        record.wanted_state = wanted;
        true
    }

    /// Record for one node.
    #[must_use]
    pub fn record(&self, node: &NodeId) -> Option<&NodeHealthRecord> {
        self.records.get(node)
    }

    /// Tracked nodes.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.records.keys().copied()
    }

    /// Effective state per node.
    #[must_use]
    pub fn effective_states(&self) -> BTreeMap<NodeId, WireState> {
        self.records
            .iter()
            .map(|(node, record)| (*node, record.effective_state()))
            .collect()
    }

    /// Highest version any node reported acknowledging.
    #[must_use]
    pub fn max_acked_version(&self) -> u64 {
        self.records
            .values()
            .map(NodeHealthRecord::acked_version)
            .max()
            .unwrap_or(0)
    }

    /// Immutable copy of every record.
    #[must_use]
    pub fn snapshot(&self) -> Arc<NodeStateSnapshot> {
        Arc::new(NodeStateSnapshot {
            nodes: self
                .records
                .iter()
                .map(|(node, record)| (*node, NodeStateView::new(*node, record)))
                .collect(),
        })
    }

    /// Adapts to a new topology: survivors keep their records, new nodes start down,
    /// removed nodes are dropped.
    pub fn reconfigure(&mut self, nodes: impl IntoIterator<Item = NodeId>, now_ms: u64) {
        let nodes: BTreeSet<NodeId> = nodes.into_iter().collect();

        self.records.retain(|node, _| nodes.contains(node));
        for node in nodes {
            self.records
                .entry(node)
                .or_insert_with(|| NodeHealthRecord::new(now_ms));
        }
    }
}
