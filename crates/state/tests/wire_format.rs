//! Wire format compatibility and round trip properties

use fleet_state::{
    ClusterState, ClusterStateBundle, NodeId, NodeType, StateParseError, WireState,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn wire_state() -> impl Strategy<Value = WireState> {
    prop::sample::select(WireState::ALL.to_vec())
}

fn node_type() -> impl Strategy<Value = NodeType> {
    prop::sample::select(NodeType::ALL.to_vec())
}

prop_compose! {
    fn cluster_state()(
        version in 0u64..1_000_000,
        cluster_up in any::<bool>(),
        bits in 1u16..=32,
        nodes in prop::collection::vec((node_type(), 0u16..40, wire_state()), 0..25),
    ) -> ClusterState {
        let mut state = ClusterState::new(version);
        state.set_cluster_up(cluster_up);
        state.set_distribution_bits(bits);
        for (node_type, index, node_state) in nodes {
            state.set_node_state(NodeId::new(node_type, index), node_state);
        }
        state
    }
}

proptest! {
    #[test]
    fn format_then_parse_is_identity(state in cluster_state()) {
        let parsed: ClusterState = state.to_string().parse().unwrap();
        prop_assert_eq!(parsed, state);
    }

    #[test]
    fn parse_never_panics(input in "[a-z:.0-9 ]{0,40}") {
        let _ = input.parse::<ClusterState>();
    }
}

#[test]
fn parses_states_written_by_deployed_nodes() {
    let raw = "version:4711 bits:20 distributor:5 .2.s:d storage:6 .1.s:m .3.s:r .3.m:draining .5.s:i";
    let state: ClusterState = raw.parse().unwrap();

    assert_eq!(state.version(), 4711);
    assert_eq!(state.distribution_bits(), 20);
    assert_eq!(state.node_count(NodeType::Distributor), 5);
    assert_eq!(state.node_count(NodeType::Storage), 6);
    assert_eq!(state.available_count(NodeType::Distributor), 4);
    // storage.1 in maintenance is the only unavailable storage node
    assert_eq!(state.available_count(NodeType::Storage), 5);
    assert_eq!(state.node_state(&NodeId::storage(3)), WireState::Retired);

    // per-node descriptions are not carried through
    assert_eq!(
        state.to_string(),
        "version:4711 bits:20 distributor:5 .2.s:d storage:6 .1.s:m .3.s:r .5.s:i"
    );
}

#[test]
fn storage_section_before_distributor_section_is_accepted() {
    let state: ClusterState = "version:2 storage:2 .0.s:d distributor:1".parse().unwrap();

    assert_eq!(state.node_state(&NodeId::storage(0)), WireState::Down);
    assert_eq!(state.to_string(), "version:2 distributor:1 storage:2 .0.s:d");
}

#[test]
fn per_node_token_without_key_is_malformed() {
    assert_eq!(
        "version:1 storage:3 .1".parse::<ClusterState>(),
        Err(StateParseError::MalformedToken(".1".to_string()))
    );
}

#[test]
fn bundle_raw_states_parse_back() {
    let mut baseline = ClusterState::new(9);
    baseline.set_node_state(NodeId::distributor(1), WireState::Up);
    baseline.set_node_state(NodeId::storage(2), WireState::Up);

    let bundle = ClusterStateBundle::baseline_only(baseline.clone());
    for raw in bundle.raw_states_by_space().values() {
        assert_eq!(raw.parse::<ClusterState>().unwrap(), baseline);
    }
}
