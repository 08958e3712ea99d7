#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fleet_communicator::{Ack, NodeCommunicator, NodeReport};
use fleet_communicator_memory::MemoryCommunicator;
use fleet_controller::{
    ClusterStateComputer, ControllerInput, FleetControllerOptions, MasterElectionHandler,
    TickOutcome, TopologyOptions,
};
use fleet_lease::FencingToken;
use fleet_lease_memory::MemoryLeaseStore;
use fleet_state::{ClusterStateBundle, NodeId};
use fleet_util::{Clock, ManualClock};

pub const LEASE_TTL: Duration = Duration::from_secs(5);
pub const STEP: Duration = Duration::from_secs(1);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// 1 distributor and `storage` storage nodes with redundancy 2, 10 second stable period.
pub fn options(storage: u16) -> FleetControllerOptions {
    FleetControllerOptions {
        topology: TopologyOptions::flat(1, storage, 2),
        stable_state_time_period: Duration::from_secs(10),
        ping_failure_threshold: 3,
        ..FleetControllerOptions::default()
    }
}

/// Forwards to a [`MemoryCommunicator`], but can be armed to move the clock forward while
/// a bundle is in flight, which makes the sender's lease run out mid delivery.
#[derive(Clone, Debug)]
pub struct LeaseLossCommunicator {
    inner: MemoryCommunicator,
    clock: Arc<ManualClock>,
    jump_ms: Arc<AtomicU64>,
}

impl LeaseLossCommunicator {
    pub fn new(inner: MemoryCommunicator, clock: Arc<ManualClock>) -> Self {
        Self {
            inner,
            clock,
            jump_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The next bundle sent moves the clock forward by `by`.
    pub fn arm(&self, by: Duration) {
        self.jump_ms
            .store(u64::try_from(by.as_millis()).unwrap(), Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeCommunicator for LeaseLossCommunicator {
    type Error = fleet_communicator_memory::Error;

    async fn ping(&self, node: NodeId, timeout: Duration) -> Result<NodeReport, Self::Error> {
        self.inner.ping(node, timeout).await
    }

    async fn send_bundle(
        &self,
        node: NodeId,
        bundle: Arc<ClusterStateBundle>,
        token: FencingToken,
        timeout: Duration,
    ) -> Result<Ack, Self::Error> {
        let jump = self.jump_ms.swap(0, Ordering::SeqCst);
        if jump > 0 {
            self.clock.advance_ms(jump);
        }
        self.inner.send_bundle(node, bundle, token, timeout).await
    }
}

pub struct Replica<C>
where
    C: NodeCommunicator,
{
    pub election: MasterElectionHandler<MemoryLeaseStore>,
    pub computer: ClusterStateComputer<C>,
}

/// Controller replicas and simulated nodes driven by hand on a shared manual clock.
pub struct Fleet<C>
where
    C: NodeCommunicator,
{
    pub clock: Arc<ManualClock>,
    pub store: MemoryLeaseStore,
    pub nodes: MemoryCommunicator,
    pub communicator: C,
    pub replicas: Vec<Replica<C>>,
    pub options: FleetControllerOptions,
}

impl Fleet<MemoryCommunicator> {
    pub async fn new(options: FleetControllerOptions, replicas: u16) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let nodes = MemoryCommunicator::with_nodes(options.topology.nodes()).await;
        Self::with_communicator(options, replicas, clock, nodes.clone(), nodes)
    }
}

impl Fleet<LeaseLossCommunicator> {
    pub async fn with_lease_loss(options: FleetControllerOptions, replicas: u16) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let nodes = MemoryCommunicator::with_nodes(options.topology.nodes()).await;
        let communicator = LeaseLossCommunicator::new(nodes.clone(), clock.clone());
        Self::with_communicator(options, replicas, clock, nodes, communicator)
    }
}

impl<C> Fleet<C>
where
    C: NodeCommunicator,
{
    fn with_communicator(
        options: FleetControllerOptions,
        replicas: u16,
        clock: Arc<ManualClock>,
        nodes: MemoryCommunicator,
        communicator: C,
    ) -> Self {
        let store = MemoryLeaseStore::new(clock.clone(), LEASE_TTL);

        let replicas = (0..replicas)
            .map(|index| {
                let options = FleetControllerOptions {
                    controller_index: index,
                    controller_count: replicas,
                    ..options.clone()
                };
                Replica {
                    election: MasterElectionHandler::new(
                        store.connect(index),
                        index,
                        replicas,
                        clock.clone(),
                    ),
                    computer: ClusterStateComputer::new(options, communicator.clone(), 0)
                        .unwrap(),
                }
            })
            .collect();

        Self {
            clock,
            store,
            nodes,
            communicator,
            replicas,
            options,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Pings every node from replica `index` and feeds the answers to its computer.
    pub async fn poll_nodes(&mut self, index: usize) {
        let timeout = self.options.ping_timeout;
        let nodes: Vec<NodeId> = self.options.topology.nodes().into_iter().collect();
        let at_ms = self.now_ms();

        for node in nodes {
            let input = match self.communicator.ping_with_deadline(node, timeout).await {
                Ok(report) => ControllerInput::NodeReport {
                    node,
                    report,
                    at_ms,
                },
                Err(e) => ControllerInput::PingFailure {
                    node,
                    reason: e.to_string(),
                    at_ms,
                },
            };
            self.replicas[index].computer.apply(input).unwrap();
        }
    }

    /// Election round, node poll and control pass for one replica at the current time.
    pub async fn tick_replica(&mut self, index: usize) -> TickOutcome {
        self.replicas[index].election.tick().await;
        self.poll_nodes(index).await;

        let now_ms = self.now_ms();
        let replica = &mut self.replicas[index];
        let watch = replica.election.watch();
        replica.computer.tick(now_ms, &watch).await.unwrap()
    }

    /// [`tick_replica`](Self::tick_replica) for every replica, in index order.
    pub async fn tick_all(&mut self) -> Vec<TickOutcome> {
        let mut outcomes = Vec::new();
        for index in 0..self.replicas.len() {
            outcomes.push(self.tick_replica(index).await);
        }
        outcomes
    }

    /// Advances the clock by one step, then ticks every replica.
    pub async fn step(&mut self) -> Vec<TickOutcome> {
        self.clock.advance(STEP);
        self.tick_all().await
    }

    /// Steps until the clock reads `until_ms`.
    pub async fn run_until(&mut self, until_ms: u64) -> Vec<TickOutcome> {
        let mut last = Vec::new();
        while self.now_ms() < until_ms {
            last = self.step().await;
        }
        last
    }

    pub fn computer(&self, index: usize) -> &ClusterStateComputer<C> {
        &self.replicas[index].computer
    }

    pub fn current_bundle(&self, index: usize) -> Arc<ClusterStateBundle> {
        self.replicas[index].computer.current_bundle()
    }

    /// Highest version acknowledged per node.
    pub async fn acked_versions(&self) -> BTreeMap<NodeId, u64> {
        let mut acked = BTreeMap::new();
        for node in self.options.topology.nodes() {
            acked.insert(node, self.nodes.acked_version(node).await.unwrap_or(0));
        }
        acked
    }
}

pub fn published_version(outcome: &TickOutcome) -> Option<u64> {
    match outcome {
        TickOutcome::Master {
            version,
            published: true,
            ..
        } => Some(*version),
        _ => None,
    }
}
