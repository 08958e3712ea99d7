//! Derivation of candidate bundles from node states

use std::collections::{BTreeMap, BTreeSet};

use fleet_state::{
    BundleError, ClusterState, ClusterStateBundle, FeedBlockStatus, NodeId, NodeType,
    ResourceUsage, WireState,
};

use crate::feed_block::FeedBlockEvaluator;
use crate::node_state::NodeStateSnapshot;
use crate::options::FleetControllerOptions;

/// Builds the unversioned candidate bundle for the current node states.
///
/// The baseline contains the resolved state of every configured node. Storage groups with
/// too few available members are taken down entirely, and the cluster is marked down when
/// too few nodes of either type are available. Each bucket space starts from the same
/// resolved states with non-participating storage nodes down, then gets the same rules
/// applied to its participating members.
///
/// # Errors
///
/// Fails only if the assembled bundle is inconsistent.
pub fn derive_bundle(
    options: &FleetControllerOptions,
    nodes: &NodeStateSnapshot,
    evaluator: &FeedBlockEvaluator,
    previous_feed_block: Option<&FeedBlockStatus>,
) -> Result<ClusterStateBundle, BundleError> {
    let topology = &options.topology;

    let mut resolved = ClusterState::new(0);
    resolved.set_distribution_bits(topology.distribution_bits);
    for node in topology.nodes() {
        resolved.set_node_state(node, nodes.resolved_state(&node));
    }

    let all_storage: BTreeSet<u16> = topology
        .storage_nodes()
        .iter()
        .map(NodeId::index)
        .collect();

    let mut baseline = resolved.clone();
    apply_availability_rules(&mut baseline, &all_storage, options);

    let mut derived = BTreeMap::new();
    for space in &topology.bucket_spaces {
        let participating: BTreeSet<u16> = space
            .storage_nodes
            .as_ref()
            .map_or_else(|| all_storage.clone(), |indices| indices.iter().copied().collect());

        let mut state = resolved.clone();
        for index in all_storage.difference(&participating) {
            state.set_node_state(NodeId::storage(*index), WireState::Down);
        }
        apply_availability_rules(&mut state, &participating, options);

        derived.insert(space.name.clone(), state);
    }

    let usage: BTreeMap<NodeId, ResourceUsage> = baseline
        .nodes_of_type(NodeType::Storage)
        .filter(|(_, state)| state.is_available())
        .filter_map(|(node, _)| {
            nodes
                .get(&node)
                .filter(|view| !view.resource_usage.is_empty())
                .map(|view| (node, view.resource_usage.clone()))
        })
        .collect();
    let feed_block = evaluator.evaluate_with_previous(&usage, previous_feed_block);

    ClusterStateBundle::new(baseline, derived, Some(feed_block))
}

/// Group takedown followed by the cluster level minimums.
fn apply_availability_rules(
    state: &mut ClusterState,
    participating: &BTreeSet<u16>,
    options: &FleetControllerOptions,
) {
    for group in &options.topology.storage_groups {
        let members: Vec<NodeId> = group
            .nodes
            .iter()
            .filter(|index| participating.contains(*index))
            .map(|index| NodeId::storage(*index))
            .collect();

        let available: Vec<NodeId> = members
            .iter()
            .copied()
            .filter(|node| state.node_state(node).is_available())
            .collect();

        if !members.is_empty()
            && ratio(available.len(), members.len()) < options.min_node_ratio_per_group
        {
            for node in available {
                state.set_node_state(node, WireState::Down);
            }
        }
    }

    let storage_available = participating
        .iter()
        .filter(|index| state.node_state(&NodeId::storage(**index)).is_available())
        .count();
    let distributors = usize::from(options.topology.distributors);
    let distributors_available = state.available_count(NodeType::Distributor);

    let up = storage_available >= options.min_storage_nodes_up
        && distributors_available >= options.min_distributor_nodes_up
        && ratio(storage_available, participating.len()) >= options.min_ratio_of_storage_nodes_up
        && ratio(distributors_available, distributors) >= options.min_ratio_of_distributor_nodes_up;

    state.set_cluster_up(up);
}

#[allow(clippy::cast_precision_loss)]
fn ratio(available: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        available as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_state::NodeStateTracker;
    use crate::options::{BucketSpaceOptions, StorageGroup, TopologyOptions};
    use fleet_state::{BASELINE_SPACE, DEFAULT_SPACE, GLOBAL_SPACE};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn options(topology: TopologyOptions) -> FleetControllerOptions {
        FleetControllerOptions {
            topology,
            stable_state_time_period: Duration::ZERO,
            ..FleetControllerOptions::default()
        }
    }

    fn snapshot(
        options: &FleetControllerOptions,
        states: &[(NodeId, WireState)],
    ) -> std::sync::Arc<NodeStateSnapshot> {
        let mut tracker = NodeStateTracker::from_options(options, 0);
        for (node, state) in states {
            tracker.report_state(*node, *state, 1);
        }
        tracker.tick(1);
        tracker.snapshot()
    }

    fn all_up(options: &FleetControllerOptions) -> Vec<(NodeId, WireState)> {
        options
            .topology
            .nodes()
            .into_iter()
            .map(|node| (node, WireState::Up))
            .collect()
    }

    fn derive(options: &FleetControllerOptions, states: &[(NodeId, WireState)]) -> ClusterStateBundle {
        let evaluator = FeedBlockEvaluator::new(&options.feed_block);
        derive_bundle(options, &snapshot(options, states), &evaluator, None).unwrap()
    }

    #[test]
    fn test_baseline_and_spaces() {
        let options = options(TopologyOptions::flat(2, 3, 2));
        let mut states = all_up(&options);
        states.push((NodeId::storage(1), WireState::Maintenance));

        let bundle = derive(&options, &states);
        let raw = bundle.raw_states_by_space();

        assert_eq!(bundle.version(), 0);
        assert_eq!(raw[BASELINE_SPACE], "version:0 distributor:2 storage:3 .1.s:m");
        assert_eq!(raw[DEFAULT_SPACE], raw[BASELINE_SPACE]);
        assert_eq!(raw[GLOBAL_SPACE], raw[BASELINE_SPACE]);
        assert!(!bundle.feed_block().unwrap().blocked);
    }

    #[test]
    fn test_non_participating_nodes_down_in_space() {
        let mut topology = TopologyOptions::flat(1, 3, 1);
        topology.bucket_spaces = vec![BucketSpaceOptions {
            name: "sparse".to_string(),
            storage_nodes: Some(vec![0, 2]),
        }];
        let options = options(topology);

        let bundle = derive(&options, &all_up(&options));

        assert_eq!(
            bundle.state_for_space("sparse").to_string(),
            "version:0 distributor:1 storage:3 .1.s:d"
        );
        assert_eq!(
            bundle.baseline().to_string(),
            "version:0 distributor:1 storage:3"
        );
    }

    #[test]
    fn test_group_takedown() {
        let mut topology = TopologyOptions::flat(1, 0, 2);
        topology.storage_groups = vec![
            StorageGroup {
                name: "g0".to_string(),
                nodes: vec![0, 1],
            },
            StorageGroup {
                name: "g1".to_string(),
                nodes: vec![2, 3],
            },
        ];
        let mut options = options(topology);
        options.min_node_ratio_per_group = 0.6;

        let mut states = all_up(&options);
        states.push((NodeId::storage(1), WireState::Down));

        let bundle = derive(&options, &states);

        // storage.0 is up but its group is below the ratio
        assert_eq!(
            bundle.baseline().node_state(&NodeId::storage(0)),
            WireState::Down
        );
        assert_eq!(
            bundle.baseline().node_state(&NodeId::storage(2)),
            WireState::Up
        );
        assert!(bundle.baseline().is_cluster_up());
    }

    #[test]
    fn test_group_takedown_counts_space_members_only() {
        let mut topology = TopologyOptions::flat(1, 0, 2);
        topology.storage_groups = vec![
            StorageGroup {
                name: "g0".to_string(),
                nodes: vec![0, 1, 2],
            },
            StorageGroup {
                name: "g1".to_string(),
                nodes: vec![3, 4],
            },
        ];
        topology.bucket_spaces = vec![
            BucketSpaceOptions {
                name: "tail".to_string(),
                storage_nodes: Some(vec![1, 2, 3, 4]),
            },
            BucketSpaceOptions {
                name: "head".to_string(),
                storage_nodes: Some(vec![0, 3, 4]),
            },
        ];
        let mut options = options(topology);
        options.min_node_ratio_per_group = 0.6;

        // 2 of 3 in g0 is enough for the baseline, 1 of the 2 members in "tail" is not
        let mut states = all_up(&options);
        states.push((NodeId::storage(2), WireState::Down));
        let bundle = derive(&options, &states);

        assert_eq!(
            bundle.baseline().node_state(&NodeId::storage(1)),
            WireState::Up
        );
        assert_eq!(
            bundle.state_for_space("tail").node_state(&NodeId::storage(1)),
            WireState::Down
        );
        assert_eq!(
            bundle.state_for_space("tail").node_state(&NodeId::storage(3)),
            WireState::Up
        );

        // 1 of 3 takes g0 down in the baseline, yet storage.0 is all of g0 in "head"
        states.push((NodeId::storage(1), WireState::Down));
        let bundle = derive(&options, &states);

        assert_eq!(
            bundle.baseline().node_state(&NodeId::storage(0)),
            WireState::Down
        );
        assert_eq!(
            bundle.state_for_space("head").node_state(&NodeId::storage(0)),
            WireState::Up
        );
    }

    #[test]
    fn test_cluster_down_below_minimums() {
        let mut options = options(TopologyOptions::flat(1, 4, 2));
        options.min_ratio_of_storage_nodes_up = 0.5;

        let mut states = all_up(&options);
        states.push((NodeId::storage(0), WireState::Down));
        states.push((NodeId::storage(1), WireState::Down));
        assert!(derive(&options, &states).baseline().is_cluster_up());

        states.push((NodeId::storage(2), WireState::Down));
        let bundle = derive(&options, &states);
        assert!(!bundle.baseline().is_cluster_up());
        assert!(!bundle.state_for_space(DEFAULT_SPACE).is_cluster_up());

        let no_distributors = vec![(NodeId::storage(0), WireState::Up)];
        assert!(!derive(&options, &no_distributors).baseline().is_cluster_up());
    }

    #[test]
    fn test_feed_block_uses_available_storage_nodes() {
        let options = options(TopologyOptions::flat(1, 3, 2));
        let evaluator = FeedBlockEvaluator::new(&options.feed_block);
        let mut tracker = NodeStateTracker::from_options(&options, 0);
        for node in options.topology.nodes() {
            tracker.report_state(node, WireState::Up, 1);
        }
        for index in 0..2 {
            tracker.report_resource_usage(
                NodeId::storage(index),
                ResourceUsage::from([("disk".to_string(), 0.85)]),
                1,
            );
        }
        tracker.report_resource_usage(
            NodeId::storage(2),
            ResourceUsage::from([("disk".to_string(), 0.3)]),
            1,
        );
        tracker.tick(1);

        let bundle = derive_bundle(&options, &tracker.snapshot(), &evaluator, None).unwrap();
        assert!(bundle.feed_block().unwrap().blocked);

        // usage of unavailable nodes does not count
        tracker.set_wanted_state(NodeId::storage(0), Some(WireState::Maintenance));
        tracker.set_wanted_state(NodeId::storage(1), Some(WireState::Maintenance));
        let bundle = derive_bundle(&options, &tracker.snapshot(), &evaluator, None).unwrap();
        assert!(!bundle.feed_block().unwrap().blocked);
    }
}
