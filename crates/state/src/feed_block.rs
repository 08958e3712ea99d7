//! Feed block status attached to published bundles

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Latest resource usage a node reported, as fractions in `[0, 1]` keyed by resource name
/// (`disk`, `memory`, ...).
pub type ResourceUsage = BTreeMap<String, f64>;

/// One node exceeding one resource limit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceExhaustion {
    /// Node over the limit.
    pub node: NodeId,

    /// Resource name.
    pub resource: String,

    /// Reported usage fraction.
    pub usage: f64,

    /// Configured limit fraction.
    pub limit: f64,
}

impl ResourceExhaustion {
    /// Renders as `disk on node storage.0 (85.0% > 80.0%)`.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "{} on node {} ({:.1}% > {:.1}%)",
            self.resource,
            self.node,
            self.usage * 100.0,
            self.limit * 100.0
        )
    }
}

/// Whether client feed is currently blocked, and why.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedBlockStatus {
    /// Feed is rejected while set.
    pub blocked: bool,

    /// Human readable reason, empty when not blocked.
    pub description: String,

    /// Every exhausted (node, resource) pair, ordered by node then resource.
    pub exhaustions: Vec<ResourceExhaustion>,
}

impl FeedBlockStatus {
    /// Status for an unblocked cluster.
    #[must_use]
    pub fn not_blocked() -> Self {
        Self::default()
    }

    /// The set of exhausted `(node, resource)` pairs.
    #[must_use]
    pub fn exhausted_keys(&self) -> BTreeSet<(NodeId, &str)> {
        self.exhaustions
            .iter()
            .map(|e| (e.node, e.resource.as_str()))
            .collect()
    }

    /// Two statuses are similar when both block (or both don't) and the same node
    /// resources are exhausted. Usage drift alone is not a difference.
    #[must_use]
    pub fn similar_to(&self, other: &Self) -> bool {
        self.blocked == other.blocked && self.exhausted_keys() == other.exhausted_keys()
    }
}
