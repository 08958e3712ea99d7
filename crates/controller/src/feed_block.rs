//! Feed block evaluation from node resource usage

use std::collections::{BTreeMap, BTreeSet};

use fleet_state::{FeedBlockStatus, NodeId, ResourceExhaustion, ResourceUsage};

use crate::options::FeedBlockOptions;

/// Decides whether client feed must be blocked because nodes are running out of
/// resources. Pure: the result depends only on the arguments.
#[derive(Clone, Debug)]
pub struct FeedBlockEvaluator {
    enabled: bool,
    limits: BTreeMap<String, f64>,
    noise_level: f64,
    min_node_ratio: f64,
}

impl FeedBlockEvaluator {
    /// Creates an evaluator from configuration.
    #[must_use]
    pub fn new(options: &FeedBlockOptions) -> Self {
        Self {
            enabled: options.enabled,
            limits: options.limits.clone(),
            noise_level: options.noise_level,
            min_node_ratio: options.min_node_ratio,
        }
    }

    /// Evaluates usage reports with no history.
    #[must_use]
    pub fn evaluate(&self, reports: &BTreeMap<NodeId, ResourceUsage>) -> FeedBlockStatus {
        self.evaluate_with_previous(reports, None)
    }

    /// Evaluates usage reports. Resources already exhausted in `previous` stay exhausted
    /// until their usage drops below `limit - noise_level`, so usage hovering right at
    /// the limit does not toggle the block.
    #[must_use]
    pub fn evaluate_with_previous(
        &self,
        reports: &BTreeMap<NodeId, ResourceUsage>,
        previous: Option<&FeedBlockStatus>,
    ) -> FeedBlockStatus {
        if !self.enabled || reports.is_empty() {
            return FeedBlockStatus::not_blocked();
        }

        let previously_exhausted = previous.map(FeedBlockStatus::exhausted_keys).unwrap_or_default();

        let mut exhaustions = Vec::new();
        for (node, usage) in reports {
            for (resource, limit) in &self.limits {
                let Some(used) = usage.get(resource).copied() else {
                    continue;
                };

                let exhausted = if previously_exhausted.contains(&(*node, resource.as_str())) {
                    used >= limit - self.noise_level
                } else {
                    used > *limit
                };

                if exhausted {
                    exhaustions.push(ResourceExhaustion {
                        node: *node,
                        resource: resource.clone(),
                        usage: used,
                        limit: *limit,
                    });
                }
            }
        }

        let exhausted_nodes: BTreeSet<NodeId> = exhaustions.iter().map(|e| e.node).collect();
        if exhausted_nodes.len() < self.required_exhausted_nodes(reports.len()) {
            return FeedBlockStatus::not_blocked();
        }

        FeedBlockStatus {
            blocked: true,
            description: exhaustions
                .iter()
                .map(ResourceExhaustion::describe)
                .collect::<Vec<_>>()
                .join(", "),
            exhaustions,
        }
    }

    /// `max(1, ceil(min_node_ratio * reporting))`
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    fn required_exhausted_nodes(&self, reporting: usize) -> usize {
        ((self.min_node_ratio * reporting as f64).ceil() as usize).max(1)
    }
}
