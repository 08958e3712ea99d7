//! Controller configuration

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use fleet_state::{
    BASELINE_SPACE, DEFAULT_DISTRIBUTION_BITS, DEFAULT_SPACE, GLOBAL_SPACE, NodeId,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fleet controller configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetControllerOptions {
    /// Name of the content cluster
    pub cluster_name: String,

    /// Index of this controller replica
    pub controller_index: u16,

    /// Number of controller replicas
    pub controller_count: u16,

    /// Nodes, groups and bucket spaces
    pub topology: TopologyOptions,

    /// How long a reported state must hold before it becomes effective
    pub stable_state_time_period: Duration,

    /// Consecutive failed pings after which a node counts as down
    pub ping_failure_threshold: u32,

    /// Deadline for a single ping
    pub ping_timeout: Duration,

    /// Deadline for delivering a bundle to a single node
    pub publish_timeout: Duration,

    /// Control loop period
    pub tick_interval: Duration,

    /// Election (lease renewal) period
    pub lease_renew_interval: Duration,

    /// Storage groups with a lower ratio of available nodes are taken down entirely
    pub min_node_ratio_per_group: f64,

    /// Cluster is down with fewer available storage nodes
    pub min_storage_nodes_up: usize,

    /// Cluster is down with fewer available distributors
    pub min_distributor_nodes_up: usize,

    /// Cluster is down with a lower ratio of available storage nodes
    pub min_ratio_of_storage_nodes_up: f64,

    /// Cluster is down with a lower ratio of available distributors
    pub min_ratio_of_distributor_nodes_up: f64,

    /// Feed block configuration
    pub feed_block: FeedBlockOptions,

    /// Max cluster state history entries
    pub max_history_entries: usize,

    /// History entries older than this are dropped (newest always kept)
    pub max_history_age: Option<Duration>,

    /// Max event log entries
    pub max_event_log_size: usize,

    /// Capacity of the inbound input queue
    pub inbound_queue_size: usize,
}

/// Content cluster topology
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyOptions {
    /// Number of distributors, indexed `0..distributors`
    pub distributors: u16,

    /// Storage nodes by redundancy group
    pub storage_groups: Vec<StorageGroup>,

    /// Copies kept of each bucket. Only validated; which groups are taken down is
    /// decided by [`FleetControllerOptions::min_node_ratio_per_group`].
    pub redundancy: u16,

    /// Distribution bits announced in the cluster state
    pub distribution_bits: u16,

    /// Bucket spaces to derive states for
    pub bucket_spaces: Vec<BucketSpaceOptions>,
}

/// A redundancy group of storage nodes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageGroup {
    /// Group name
    pub name: String,

    /// Storage node indices in the group
    pub nodes: Vec<u16>,
}

/// A bucket space
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSpaceOptions {
    /// Space name
    pub name: String,

    /// Storage nodes participating in the space, all of them if unset
    pub storage_nodes: Option<Vec<u16>>,
}

impl BucketSpaceOptions {
    /// Space every storage node participates in.
    #[must_use]
    pub fn all_nodes(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage_nodes: None,
        }
    }
}

/// Feed block configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedBlockOptions {
    /// Whether feed may be blocked at all
    pub enabled: bool,

    /// Max usage fraction per resource name
    pub limits: BTreeMap<String, f64>,

    /// An exhausted resource stays exhausted until usage drops this far below its limit
    pub noise_level: f64,

    /// Ratio of reporting nodes that must be exhausted before feed is blocked
    pub min_node_ratio: f64,
}

impl Default for FleetControllerOptions {
    fn default() -> Self {
        Self {
            cluster_name: "content".to_string(),
            controller_index: 0,
            controller_count: 1,
            topology: TopologyOptions::default(),
            stable_state_time_period: Duration::from_secs(10),
            ping_failure_threshold: 3,
            ping_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_secs(1),
            lease_renew_interval: Duration::from_secs(1),
            min_node_ratio_per_group: 0.0,
            min_storage_nodes_up: 1,
            min_distributor_nodes_up: 1,
            min_ratio_of_storage_nodes_up: 0.0,
            min_ratio_of_distributor_nodes_up: 0.0,
            feed_block: FeedBlockOptions::default(),
            max_history_entries: 50,
            max_history_age: None,
            max_event_log_size: 1000,
            inbound_queue_size: 1024,
        }
    }
}

impl Default for TopologyOptions {
    fn default() -> Self {
        Self {
            distributors: 0,
            storage_groups: Vec::new(),
            redundancy: 1,
            distribution_bits: DEFAULT_DISTRIBUTION_BITS,
            bucket_spaces: vec![
                BucketSpaceOptions::all_nodes(DEFAULT_SPACE),
                BucketSpaceOptions::all_nodes(GLOBAL_SPACE),
            ],
        }
    }
}

impl Default for FeedBlockOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            limits: BTreeMap::from([("disk".to_string(), 0.8), ("memory".to_string(), 0.8)]),
            noise_level: 0.01,
            min_node_ratio: 0.5,
        }
    }
}

impl TopologyOptions {
    /// Flat topology: `distributors` distributors and one group of `storage` storage nodes.
    #[must_use]
    pub fn flat(distributors: u16, storage: u16, redundancy: u16) -> Self {
        Self {
            distributors,
            storage_groups: vec![StorageGroup {
                name: "root".to_string(),
                nodes: (0..storage).collect(),
            }],
            redundancy,
            ..Self::default()
        }
    }

    /// Every configured distributor.
    pub fn distributor_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.distributors).map(NodeId::distributor)
    }

    /// Every configured storage node, in index order.
    #[must_use]
    pub fn storage_nodes(&self) -> BTreeSet<NodeId> {
        self.storage_groups
            .iter()
            .flat_map(|group| group.nodes.iter().copied().map(NodeId::storage))
            .collect()
    }

    /// Every configured node, distributors first.
    #[must_use]
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        let mut nodes = self.storage_nodes();
        nodes.extend(self.distributor_nodes());
        nodes
    }

    fn validate(&self) -> Result<()> {
        if self.redundancy == 0 {
            return Err(Error::Configuration("redundancy must be at least 1".to_string()));
        }

        let mut group_names = HashSet::new();
        let mut grouped = HashSet::new();
        for group in &self.storage_groups {
            if !group_names.insert(group.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate storage group '{}'",
                    group.name
                )));
            }
            for index in &group.nodes {
                if !grouped.insert(*index) {
                    return Err(Error::Configuration(format!(
                        "storage node {index} is in more than one group"
                    )));
                }
            }
        }

        let mut space_names = HashSet::new();
        for space in &self.bucket_spaces {
            if space.name == BASELINE_SPACE {
                return Err(Error::Configuration(format!(
                    "bucket space name '{BASELINE_SPACE}' is reserved"
                )));
            }
            if !space_names.insert(space.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate bucket space '{}'",
                    space.name
                )));
            }
            if let Some(unknown) = space
                .storage_nodes
                .iter()
                .flatten()
                .find(|index| !grouped.contains(*index))
            {
                return Err(Error::Configuration(format!(
                    "bucket space '{}' names unknown storage node {unknown}",
                    space.name
                )));
            }
        }

        Ok(())
    }
}

impl FleetControllerOptions {
    /// Checks the options for inconsistencies.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.controller_count == 0 || self.controller_index >= self.controller_count {
            return Err(Error::Configuration(format!(
                "controller index {} out of range for {} controllers",
                self.controller_index, self.controller_count
            )));
        }

        for (name, value) in [
            ("tick_interval", self.tick_interval),
            ("lease_renew_interval", self.lease_renew_interval),
            ("ping_timeout", self.ping_timeout),
            ("publish_timeout", self.publish_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::Configuration(format!("{name} must be positive")));
            }
        }

        for (name, value) in [
            ("ping_failure_threshold", self.ping_failure_threshold as usize),
            ("max_history_entries", self.max_history_entries),
            ("max_event_log_size", self.max_event_log_size),
            ("inbound_queue_size", self.inbound_queue_size),
        ] {
            if value == 0 {
                return Err(Error::Configuration(format!("{name} must be at least 1")));
            }
        }

        for (name, value) in [
            ("min_node_ratio_per_group", self.min_node_ratio_per_group),
            ("min_ratio_of_storage_nodes_up", self.min_ratio_of_storage_nodes_up),
            (
                "min_ratio_of_distributor_nodes_up",
                self.min_ratio_of_distributor_nodes_up,
            ),
            ("feed_block.min_node_ratio", self.feed_block.min_node_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Configuration(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }

        if !(0.0..1.0).contains(&self.feed_block.noise_level) {
            return Err(Error::Configuration(format!(
                "feed_block.noise_level must be within [0, 1), got {}",
                self.feed_block.noise_level
            )));
        }

        for (resource, limit) in &self.feed_block.limits {
            if !(*limit > 0.0 && *limit <= 1.0) {
                return Err(Error::Configuration(format!(
                    "feed block limit for '{resource}' must be within (0, 1], got {limit}"
                )));
            }
        }

        self.topology.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn options() -> FleetControllerOptions {
        FleetControllerOptions {
            topology: TopologyOptions::flat(2, 3, 2),
            ..FleetControllerOptions::default()
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(FleetControllerOptions::default().validate().is_ok());
        assert!(options().validate().is_ok());
    }

    #[test]
    fn test_topology_nodes() {
        let topology = TopologyOptions::flat(2, 3, 2);
        let nodes: Vec<String> = topology.nodes().iter().map(ToString::to_string).collect();
        assert_eq!(
            nodes,
            vec![
                "distributor.0",
                "distributor.1",
                "storage.0",
                "storage.1",
                "storage.2"
            ]
        );
    }

    #[test]
    fn test_rejects_controller_index_out_of_range() {
        let options = FleetControllerOptions {
            controller_index: 3,
            controller_count: 3,
            ..options()
        };
        assert_matches!(options.validate(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_rejects_bad_topology() {
        let mut zero_redundancy = options();
        zero_redundancy.topology.redundancy = 0;
        assert_matches!(zero_redundancy.validate(), Err(Error::Configuration(_)));

        let mut overlapping = options();
        overlapping.topology.storage_groups.push(StorageGroup {
            name: "other".to_string(),
            nodes: vec![2, 3],
        });
        assert_matches!(overlapping.validate(), Err(Error::Configuration(msg)) if msg.contains("more than one group"));

        let mut reserved = options();
        reserved
            .topology
            .bucket_spaces
            .push(BucketSpaceOptions::all_nodes(BASELINE_SPACE));
        assert_matches!(reserved.validate(), Err(Error::Configuration(msg)) if msg.contains("reserved"));

        let mut duplicate = options();
        duplicate
            .topology
            .bucket_spaces
            .push(BucketSpaceOptions::all_nodes(GLOBAL_SPACE));
        assert_matches!(duplicate.validate(), Err(Error::Configuration(_)));

        let mut unknown = options();
        unknown.topology.bucket_spaces.push(BucketSpaceOptions {
            name: "sparse".to_string(),
            storage_nodes: Some(vec![0, 7]),
        });
        assert_matches!(unknown.validate(), Err(Error::Configuration(msg)) if msg.contains("unknown storage node 7"));
    }

    #[test]
    fn test_rejects_limits_out_of_range() {
        let mut options = options();
        options.feed_block.limits.insert("disk".to_string(), 1.5);
        assert_matches!(options.validate(), Err(Error::Configuration(_)));

        options.feed_block.limits.insert("disk".to_string(), 0.0);
        assert_matches!(options.validate(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_rejects_zero_intervals() {
        let options = FleetControllerOptions {
            tick_interval: Duration::ZERO,
            ..options()
        };
        assert_matches!(options.validate(), Err(Error::Configuration(msg)) if msg.contains("tick_interval"));
    }

    #[test]
    fn test_deserializes_partial_config() {
        let json = r#"{
            "cluster_name": "music",
            "topology": {
                "distributors": 1,
                "storage_groups": [{ "name": "g0", "nodes": [0, 1] }],
                "redundancy": 2
            },
            "feed_block": { "limits": { "disk": 0.75 } }
        }"#;

        let options: FleetControllerOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.cluster_name, "music");
        assert_eq!(options.topology.bucket_spaces.len(), 2);
        assert_eq!(options.feed_block.limits.len(), 1);
        assert!(options.feed_block.enabled);
        assert!(options.validate().is_ok());
    }
}
