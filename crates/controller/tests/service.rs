use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use fleet_communicator_memory::MemoryCommunicator;
use fleet_controller::{
    Error, FleetController, FleetControllerOptions, StatusView, TopologyOptions,
};
use fleet_lease_memory::MemoryLeaseStore;
use fleet_state::{NodeId, WireState};
use fleet_util::SystemClock;
use tracing_test::traced_test;

fn options() -> FleetControllerOptions {
    FleetControllerOptions {
        topology: TopologyOptions::flat(1, 2, 1),
        stable_state_time_period: Duration::ZERO,
        tick_interval: Duration::from_millis(20),
        lease_renew_interval: Duration::from_millis(20),
        ping_timeout: Duration::from_millis(200),
        publish_timeout: Duration::from_millis(200),
        ..FleetControllerOptions::default()
    }
}

async fn controller() -> (
    FleetController<MemoryLeaseStore, MemoryCommunicator>,
    MemoryCommunicator,
) {
    let options = options();
    let clock = Arc::new(SystemClock);
    let store = MemoryLeaseStore::new(clock.clone(), Duration::from_secs(2));
    let nodes = MemoryCommunicator::with_nodes(options.topology.nodes()).await;
    let controller = FleetController::new(options, store, nodes.clone(), clock).unwrap();
    (controller, nodes)
}

async fn wait_for(status: &StatusView, condition: impl Fn(&StatusView) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition(status) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
#[traced_test]
async fn test_controller_converges_and_shuts_down() {
    let (controller, nodes) = controller().await;
    let status = controller.status();
    let handle = controller.handle();

    controller.start().unwrap();
    assert_matches!(controller.start(), Err(Error::AlreadyStarted));

    wait_for(&status, |status| {
        status.is_master() && status.current_bundle().baseline().is_cluster_up()
    })
    .await;
    assert_eq!(status.master_index(), Some(0));
    assert!(status.is_among_nth_first(1));

    let node = NodeId::storage(1);
    handle
        .set_wanted_state(node, Some(WireState::Maintenance))
        .await
        .unwrap();
    wait_for(&status, |status| {
        status.current_bundle().baseline().node_state(&node) == WireState::Maintenance
    })
    .await;

    let version = status.current_bundle().version();
    tokio::time::timeout(Duration::from_secs(5), async {
        while nodes.acked_version(node).await != Some(version) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let snapshot = status.snapshot();
    assert_eq!(snapshot.version, version);
    assert_eq!(snapshot.nodes.len(), 3);
    assert!(!snapshot.history.is_empty());
    let json = serde_json::to_string(&snapshot).unwrap();
    assert!(json.contains("\"role\":\"master\""));

    controller.shutdown().await.unwrap();
    assert!(!status.is_master());
    assert_matches!(
        handle.set_wanted_state(node, None).await,
        Err(Error::Shutdown)
    );
}

#[tokio::test]
async fn test_shutdown_before_start() {
    let (controller, _nodes) = controller().await;
    assert_matches!(controller.shutdown().await, Err(Error::NotStarted));
}

#[tokio::test]
async fn test_invalid_options_rejected() {
    let options = FleetControllerOptions {
        tick_interval: Duration::ZERO,
        ..options()
    };
    let clock = Arc::new(SystemClock);
    let store = MemoryLeaseStore::new(clock.clone(), Duration::from_secs(2));

    assert_matches!(
        FleetController::new(options, store, MemoryCommunicator::new(), clock).err(),
        Some(Error::Configuration(_))
    );
}
