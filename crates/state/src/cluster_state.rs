//! Versioned cluster state and its wire representation
//!
//! The wire form is the compact text nodes and status pages already understand:
//!
//! ```text
//! version:12 cluster:d bits:8 distributor:3 .1.s:d storage:4 .0.s:m .3.s:r
//! ```
//!
//! Only nodes that are not up are listed. `cluster:` is written only when the cluster is
//! down and `bits:` only when it differs from the default.

use std::collections::{BTreeMap, HashSet};
use std::fmt::{self, Write};
use std::str::FromStr;

use crate::error::StateParseError;
use crate::{NodeId, NodeType, WireState};

/// Distribution bit count assumed when the wire form has no `bits:` token.
pub const DEFAULT_DISTRIBUTION_BITS: u16 = 16;

/// Cluster state for one bucket space.
///
/// Node indices are dense per node type: assigning a state to index `k` materializes
/// every missing lower index of the same type as [`WireState::Down`]. Looking up a node
/// that is not present yields `Down` as well.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusterState {
    version: u64,
    cluster_up: bool,
    distribution_bits: u16,
    nodes: BTreeMap<NodeId, WireState>,
}

impl ClusterState {
    /// Creates an empty, cluster-up state with the given version.
    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self {
            version,
            cluster_up: true,
            distribution_bits: DEFAULT_DISTRIBUTION_BITS,
            nodes: BTreeMap::new(),
        }
    }

    /// Creates a state from node states.
    pub fn from_states(version: u64, states: impl IntoIterator<Item = (NodeId, WireState)>) -> Self {
        let mut state = Self::new(version);
        for (node, node_state) in states {
            state.set_node_state(node, node_state);
        }
        state
    }

    /// The state version.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Returns a copy stamped with another version.
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Whether the cluster as a whole is up.
    #[must_use]
    pub const fn is_cluster_up(&self) -> bool {
        self.cluster_up
    }

    /// Marks the whole cluster up or down.
    pub const fn set_cluster_up(&mut self, up: bool) {
        self.cluster_up = up;
    }

    /// Number of distribution bits.
    #[must_use]
    pub const fn distribution_bits(&self) -> u16 {
        self.distribution_bits
    }

    /// Sets the number of distribution bits.
    pub const fn set_distribution_bits(&mut self, bits: u16) {
        self.distribution_bits = bits;
    }

    /// State of a node, `Down` if the node is not part of this state.
    #[must_use]
    pub fn node_state(&self, node: &NodeId) -> WireState {
        self.nodes.get(node).copied().unwrap_or(WireState::Down)
    }

    /// Sets the state of a node, filling lower missing indices of its type with `Down`.
    pub fn set_node_state(&mut self, node: NodeId, state: WireState) {
        for index in 0..node.index() {
            self.nodes
                .entry(NodeId::new(node.node_type(), index))
                .or_insert(WireState::Down);
        }
        self.nodes.insert(node, state);
    }

    /// All nodes with their states, distributors first, in index order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, WireState)> + '_ {
        self.nodes.iter().map(|(node, state)| (*node, *state))
    }

    /// Nodes of one type with their states, in index order.
    pub fn nodes_of_type(&self, node_type: NodeType) -> impl Iterator<Item = (NodeId, WireState)> + '_ {
        self.nodes()
            .filter(move |(node, _)| node.node_type() == node_type)
    }

    /// Highest index + 1 among nodes of `node_type`.
    #[must_use]
    pub fn node_count(&self, node_type: NodeType) -> u16 {
        self.nodes_of_type(node_type)
            .map(|(node, _)| node.index().saturating_add(1))
            .max()
            .unwrap_or(0)
    }

    /// Number of nodes of `node_type` in an available state.
    #[must_use]
    pub fn available_count(&self, node_type: NodeType) -> usize {
        self.nodes_of_type(node_type)
            .filter(|(_, state)| state.is_available())
            .count()
    }

    /// Whether two states describe the same cluster, ignoring versions.
    #[must_use]
    pub fn same_states(&self, other: &Self) -> bool {
        self.cluster_up == other.cluster_up
            && self.distribution_bits == other.distribution_bits
            && self.nodes == other.nodes
    }

    /// Human readable description of what changed from `self` to `next`, for example
    /// `cluster: up -> down, storage.1: up -> down`. Empty when nothing changed.
    #[must_use]
    pub fn describe_diff(&self, next: &Self) -> String {
        let mut parts = Vec::new();

        if self.cluster_up != next.cluster_up {
            parts.push(format!(
                "cluster: {} -> {}",
                cluster_word(self.cluster_up),
                cluster_word(next.cluster_up)
            ));
        }

        if self.distribution_bits != next.distribution_bits {
            parts.push(format!(
                "bits: {} -> {}",
                self.distribution_bits, next.distribution_bits
            ));
        }

        let mut touched: Vec<NodeId> = self.nodes.keys().chain(next.nodes.keys()).copied().collect();
        touched.sort_unstable();
        touched.dedup();

        for node in touched {
            let before = self.node_state(&node);
            let after = next.node_state(&node);
            if before != after {
                parts.push(format!("{node}: {before} -> {after}"));
            }
        }

        parts.join(", ")
    }
}

const fn cluster_word(up: bool) -> &'static str {
    if up { "up" } else { "down" }
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = format!("version:{}", self.version);

        if !self.cluster_up {
            out.push_str(" cluster:d");
        }

        if self.distribution_bits != DEFAULT_DISTRIBUTION_BITS {
            write!(out, " bits:{}", self.distribution_bits)?;
        }

        for node_type in NodeType::ALL {
            let count = self.node_count(node_type);
            if count == 0 {
                continue;
            }

            write!(out, " {node_type}:{count}")?;
            for (node, state) in self.nodes_of_type(node_type) {
                if state != WireState::Up {
                    write!(out, " .{}.s:{}", node.index(), state.code())?;
                }
            }
        }

        f.write_str(&out)
    }
}

impl FromStr for ClusterState {
    type Err = StateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut version = None;
        let mut state = Self::new(0);
        let mut section: Option<(NodeType, u16)> = None;
        let mut seen_keys = HashSet::new();

        for token in s.split_whitespace() {
            if let Some(node_token) = token.strip_prefix('.') {
                let (node_type, count) =
                    section.ok_or_else(|| StateParseError::NodeTokenWithoutSection(token.to_string()))?;
                parse_node_token(&mut state, node_type, count, node_token, token)?;
                continue;
            }

            let (key, value) = token
                .split_once(':')
                .ok_or_else(|| StateParseError::MalformedToken(token.to_string()))?;

            if !seen_keys.insert(key) {
                return Err(StateParseError::DuplicateKey(key.to_string()));
            }

            match key {
                "version" => {
                    version = Some(
                        value
                            .parse()
                            .map_err(|_| StateParseError::InvalidNumber(token.to_string()))?,
                    );
                }
                "cluster" => {
                    state.cluster_up = WireState::from_code(value)? == WireState::Up;
                }
                "bits" => {
                    state.distribution_bits = value
                        .parse()
                        .map_err(|_| StateParseError::InvalidNumber(token.to_string()))?;
                }
                "distributor" | "storage" => {
                    let node_type: NodeType = key.parse()?;
                    let count: u16 = value
                        .parse()
                        .map_err(|_| StateParseError::InvalidNumber(token.to_string()))?;
                    for index in 0..count {
                        state.nodes.insert(NodeId::new(node_type, index), WireState::Up);
                    }
                    section = Some((node_type, count));
                }
                other => return Err(StateParseError::UnknownKey(other.to_string())),
            }
        }

        state.version = version.ok_or(StateParseError::MissingVersion)?;
        Ok(state)
    }
}

/// Parses `<idx>.<key>:<value>` (leading dot already stripped). Only the `s` key carries
/// the node state; other per-node keys (descriptions, disk counts) are accepted and ignored.
fn parse_node_token(
    state: &mut ClusterState,
    node_type: NodeType,
    count: u16,
    node_token: &str,
    token: &str,
) -> Result<(), StateParseError> {
    let (index, rest) = node_token
        .split_once('.')
        .ok_or_else(|| StateParseError::MalformedToken(token.to_string()))?;
    let index: u16 = index
        .parse()
        .map_err(|_| StateParseError::InvalidNumber(token.to_string()))?;

    if index >= count {
        return Err(StateParseError::IndexOutOfRange {
            section: node_type.to_string(),
            index,
            count,
        });
    }

    let (key, value) = rest
        .split_once(':')
        .ok_or_else(|| StateParseError::MalformedToken(token.to_string()))?;

    if key == "s" {
        state
            .nodes
            .insert(NodeId::new(node_type, index), WireState::from_code(value)?);
    }

    Ok(())
}
