//! Lock-free status surface for readers outside the control loop

use std::sync::Arc;

use arc_swap::ArcSwap;
use fleet_communicator::NodeCommunicator;
use fleet_state::{ClusterState, ClusterStateBundle, FeedBlockStatus};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::computer::ClusterStateComputer;
use crate::election::{MasterStatus, MasterWatch};
use crate::event_log::Event;
use crate::node_state::{NodeStateSnapshot, NodeStateView};
use crate::version::ClusterStateHistoryEntry;

/// Serializable point-in-time copy of everything [`StatusView`] exposes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Election state of this replica.
    pub master: MasterStatus,
    /// Current cluster state version.
    pub version: u64,
    /// Current state per space in wire form, baseline first.
    pub cluster_states: IndexMap<String, String>,
    /// Feed block status as published with the current version. Usage figures in its
    /// description are from that publication; live usage is in `nodes`.
    pub feed_block: Option<FeedBlockStatus>,
    /// Every tracked node.
    pub nodes: Vec<NodeStateView>,
    /// Publication history, newest first.
    pub history: Vec<ClusterStateHistoryEntry>,
    /// Event log, newest first.
    pub events: Vec<Event>,
}

/// Read side of the controller. Cheap to clone; reads never wait on the control loop.
#[derive(Clone, Debug)]
pub struct StatusView {
    bundle: Arc<ArcSwap<ClusterStateBundle>>,
    history: Arc<ArcSwap<Vec<Arc<ClusterStateHistoryEntry>>>>,
    nodes: Arc<ArcSwap<NodeStateSnapshot>>,
    events: Arc<ArcSwap<Vec<Event>>>,
    master: MasterWatch,
}

impl StatusView {
    /// Creates an empty view backed by `master` for election state.
    #[must_use]
    pub fn new(master: MasterWatch) -> Self {
        let mut initial = ClusterState::new(0);
        initial.set_cluster_up(false);

        Self {
            bundle: Arc::new(ArcSwap::from_pointee(ClusterStateBundle::baseline_only(
                initial,
            ))),
            history: Arc::new(ArcSwap::from_pointee(Vec::new())),
            nodes: Arc::new(ArcSwap::from_pointee(NodeStateSnapshot::default())),
            events: Arc::new(ArcSwap::from_pointee(Vec::new())),
            master,
        }
    }

    /// Copies the computer's current state into the view.
    pub fn refresh<C>(&self, computer: &ClusterStateComputer<C>)
    where
        C: NodeCommunicator,
    {
        self.bundle.store(computer.current_bundle());
        self.history.store(Arc::new(computer.history()));
        self.nodes.store(computer.node_snapshot());
        self.events.store(Arc::new(computer.events().entries()));
    }

    /// Latest published bundle.
    ///
    /// A blocked feed whose exhausted resources stay the same is not republished when
    /// usage drifts, so the feed block description keeps the figures it was published
    /// with. [`node_states`](Self::node_states) has the latest reported usage.
    #[must_use]
    pub fn current_bundle(&self) -> Arc<ClusterStateBundle> {
        self.bundle.load_full()
    }

    /// Publication history, newest first.
    #[must_use]
    pub fn history(&self) -> Arc<Vec<Arc<ClusterStateHistoryEntry>>> {
        self.history.load_full()
    }

    /// Node states as of the last refresh.
    #[must_use]
    pub fn node_states(&self) -> Arc<NodeStateSnapshot> {
        self.nodes.load_full()
    }

    /// Event log, newest first.
    #[must_use]
    pub fn events(&self) -> Arc<Vec<Event>> {
        self.events.load_full()
    }

    /// Whether this replica currently holds a valid lease.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.master.is_master()
    }

    /// Index of the known master.
    #[must_use]
    pub fn master_index(&self) -> Option<u16> {
        self.master.master_index()
    }

    /// Whether fewer than `n` reachable replicas rank before this one.
    #[must_use]
    pub fn is_among_nth_first(&self, n: usize) -> bool {
        self.master.is_among_nth_first(n)
    }

    /// Everything above in one serializable value.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let bundle = self.current_bundle();

        StatusSnapshot {
            master: (*self.master.status()).clone(),
            version: bundle.version(),
            cluster_states: bundle.raw_states_by_space(),
            feed_block: bundle.feed_block().cloned(),
            nodes: self.node_states().iter().cloned().collect(),
            history: self.history().iter().map(|entry| (**entry).clone()).collect(),
            events: (*self.events()).clone(),
        }
    }
}
