//! The controller service: election and control loop tasks

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use fleet_communicator::{NodeCommunicator, NodeReport};
use fleet_lease::LeaseStore;
use fleet_state::{NodeId, WireState};
use fleet_util::Clock;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::computer::{ClusterStateComputer, ControllerInput};
use crate::election::{MasterElectionHandler, MasterWatch};
use crate::error::{Error, Result};
use crate::options::{FleetControllerOptions, TopologyOptions};
use crate::status::StatusView;

/// One controller replica.
///
/// Runs two tasks once started: the election loop, which renews or bids for the lease
/// every `lease_renew_interval`, and the control loop, which every `tick_interval` drains
/// queued input, runs a [`ClusterStateComputer`] pass and pings nodes in the background.
/// A pass that fails on an internal error releases the lease.
/// Only the control loop ever touches controller state; everything else goes through a
/// [`ControllerHandle`] or reads a [`StatusView`].
pub struct FleetController<L, C>
where
    L: LeaseStore,
    C: NodeCommunicator,
{
    options: FleetControllerOptions,
    communicator: C,
    clock: Arc<dyn Clock>,
    election: Arc<MasterElectionHandler<L>>,
    inputs_tx: mpsc::Sender<ControllerInput>,
    inputs_rx: Mutex<Option<mpsc::Receiver<ControllerInput>>>,
    status: StatusView,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl<L, C> FleetController<L, C>
where
    L: LeaseStore,
    C: NodeCommunicator,
{
    /// Creates a stopped controller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the options are inconsistent.
    pub fn new(
        options: FleetControllerOptions,
        store: L,
        communicator: C,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        options.validate()?;

        let election = Arc::new(MasterElectionHandler::new(
            store,
            options.controller_index,
            options.controller_count,
            clock.clone(),
        ));
        let status = StatusView::new(election.watch());
        let (inputs_tx, inputs_rx) = mpsc::channel(options.inbound_queue_size);

        Ok(Self {
            options,
            communicator,
            clock,
            election,
            inputs_tx,
            inputs_rx: Mutex::new(Some(inputs_rx)),
            status,
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        })
    }

    /// Handle for submitting input.
    #[must_use]
    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            inputs: self.inputs_tx.clone(),
            reachable: self.election.reachable_controllers(),
            my_index: self.options.controller_index,
            clock: self.clock.clone(),
        }
    }

    /// Read side of the controller.
    #[must_use]
    pub fn status(&self) -> StatusView {
        self.status.clone()
    }

    /// Election state of this replica.
    #[must_use]
    pub fn master_watch(&self) -> MasterWatch {
        self.election.watch()
    }

    /// Spawns the election and control loops.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second call.
    pub fn start(&self) -> Result<()> {
        if self.task_tracker.is_closed() {
            return Err(Error::AlreadyStarted);
        }

        let Some(inputs) = self.inputs_rx.lock().take() else {
            return Err(Error::AlreadyStarted);
        };

        let computer = ClusterStateComputer::new(
            self.options.clone(),
            self.communicator.clone(),
            self.clock.now_ms(),
        )?;

        self.task_tracker.spawn(run_election_loop(
            self.election.clone(),
            self.options.lease_renew_interval,
            self.shutdown_token.clone(),
        ));

        self.task_tracker.spawn(
            ControlLoop {
                computer,
                communicator: self.communicator.clone(),
                inputs,
                inputs_tx: self.inputs_tx.clone(),
                election: self.election.clone(),
                status: self.status.clone(),
                clock: self.clock.clone(),
                pings_in_flight: Arc::new(Mutex::new(HashSet::new())),
                task_tracker: self.task_tracker.clone(),
                shutdown_token: self.shutdown_token.clone(),
            }
            .run(self.options.tick_interval, self.options.ping_timeout),
        );

        self.task_tracker.close();

        info!(
            cluster = %self.options.cluster_name,
            controller = self.options.controller_index,
            "fleet controller started"
        );

        Ok(())
    }

    /// Stops both loops, releasing the lease if held, and waits for them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] if the controller was never started.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.task_tracker.is_closed() {
            return Err(Error::NotStarted);
        }

        info!("fleet controller shutting down...");

        self.shutdown_token.cancel();
        self.task_tracker.wait().await;

        info!("fleet controller shutdown");

        Ok(())
    }

    /// Waits until the controller has been shut down.
    pub async fn wait(&self) {
        self.shutdown_token.cancelled().await;
        self.task_tracker.wait().await;
    }
}

async fn run_election_loop<L>(
    election: Arc<MasterElectionHandler<L>>,
    renew_interval: Duration,
    shutdown_token: CancellationToken,
) where
    L: LeaseStore,
{
    let mut interval = tokio::time::interval(renew_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = shutdown_token.cancelled() => break,
            _ = interval.tick() => {
                election.tick().await;
            }
        }
    }

    if let Err(e) = election.resign().await {
        warn!("failed to release lease on shutdown: {}", e);
    }
}

/// Gives up the lease after a control pass failed on an internal inconsistency.
async fn step_down_on_error<L>(election: &MasterElectionHandler<L>, error: &Error)
where
    L: LeaseStore,
{
    error!("control tick failed, giving up mastership: {}", error);

    if let Err(e) = election.resign().await {
        warn!("failed to release lease after failed tick: {}", e);
    }
}

struct ControlLoop<L, C>
where
    L: LeaseStore,
    C: NodeCommunicator,
{
    computer: ClusterStateComputer<C>,
    communicator: C,
    inputs: mpsc::Receiver<ControllerInput>,
    inputs_tx: mpsc::Sender<ControllerInput>,
    election: Arc<MasterElectionHandler<L>>,
    status: StatusView,
    clock: Arc<dyn Clock>,
    pings_in_flight: Arc<Mutex<HashSet<NodeId>>>,
    task_tracker: TaskTracker,
    shutdown_token: CancellationToken,
}

impl<L, C> ControlLoop<L, C>
where
    L: LeaseStore,
    C: NodeCommunicator,
{
    async fn run(mut self, tick_interval: Duration, ping_timeout: Duration) {
        let master = self.election.watch();
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.shutdown_token.cancelled() => {
                    info!("control loop stopping");
                    break;
                }
                _ = interval.tick() => {}
            }

            while let Ok(input) = self.inputs.try_recv() {
                if let Err(e) = self.computer.apply(input) {
                    warn!("rejected controller input: {}", e);
                }
            }

            match self.computer.tick(self.clock.now_ms(), &master).await {
                Ok(outcome) => debug!(?outcome, "control tick"),
                Err(e) => step_down_on_error(&self.election, &e).await,
            }

            self.status.refresh(&self.computer);
            self.spawn_pings(ping_timeout);
        }
    }

    /// Pings every node without an outstanding ping. Answers come back as input.
    fn spawn_pings(&self, timeout: Duration) {
        let nodes: Vec<NodeId> = {
            let mut in_flight = self.pings_in_flight.lock();
            self.computer
                .tracker()
                .nodes()
                .filter(|node| in_flight.insert(*node))
                .collect()
        };

        for node in nodes {
            let communicator = self.communicator.clone();
            let inputs = self.inputs_tx.clone();
            let clock = self.clock.clone();
            let in_flight = self.pings_in_flight.clone();
            let shutdown_token = self.shutdown_token.clone();

            self.task_tracker.spawn(async move {
                let result = tokio::select! {
                    () = shutdown_token.cancelled() => None,
                    result = communicator.ping_with_deadline(node, timeout) => Some(result),
                };
                in_flight.lock().remove(&node);

                let Some(result) = result else {
                    return;
                };

                let at_ms = clock.now_ms();
                let input = match result {
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

                if inputs.send(input).await.is_err() {
                    debug!(%node, "control loop gone, dropping ping result");
                }
            });
        }
    }
}

/// Cloneable input side of a [`FleetController`].
#[derive(Clone, Debug)]
pub struct ControllerHandle {
    inputs: mpsc::Sender<ControllerInput>,
    reachable: Arc<ArcSwap<BTreeSet<u16>>>,
    my_index: u16,
    clock: Arc<dyn Clock>,
}

impl ControllerHandle {
    /// Queues input for the control loop. Applied at the start of the next tick.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] once the control loop has stopped.
    pub async fn submit(&self, input: ControllerInput) -> Result<()> {
        self.inputs.send(input).await.map_err(|_| Error::Shutdown)
    }

    /// Forwards a report obtained outside the controller's own pings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] once the control loop has stopped.
    pub async fn report_node(&self, node: NodeId, report: NodeReport) -> Result<()> {
        self.submit(ControllerInput::NodeReport {
            node,
            report,
            at_ms: self.clock.now_ms(),
        })
        .await
    }

    /// Sets or clears an operator override for a node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] once the control loop has stopped.
    pub async fn set_wanted_state(&self, node: NodeId, state: Option<WireState>) -> Result<()> {
        self.submit(ControllerInput::WantedState {
            node,
            state,
            at_ms: self.clock.now_ms(),
        })
        .await
    }

    /// Switches to a new topology. An invalid topology is logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] once the control loop has stopped.
    pub async fn reconfigure(&self, topology: TopologyOptions) -> Result<()> {
        self.submit(ControllerInput::Reconfigure {
            topology,
            at_ms: self.clock.now_ms(),
        })
        .await
    }

    /// Replaces the set of controller replicas this one can talk to.
    pub fn set_reachable_controllers(&self, reachable: impl IntoIterator<Item = u16>) {
        let mut reachable: BTreeSet<u16> = reachable.into_iter().collect();
        reachable.insert(self.my_index);
        self.reachable.store(Arc::new(reachable));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::Role;
    use fleet_lease_memory::MemoryLeaseStore;
    use fleet_util::ManualClock;

    #[tokio::test]
    async fn test_failed_tick_gives_up_mastership() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryLeaseStore::new(clock.clone(), Duration::from_secs(5));
        let election = MasterElectionHandler::new(store.connect(0), 0, 2, clock.clone());
        let standby = MasterElectionHandler::new(store.connect(1), 1, 2, clock.clone());

        assert_eq!(election.tick().await, Role::Master);
        assert_eq!(standby.tick().await, Role::Follower);

        step_down_on_error(&election, &Error::VersionRegression { attempted: 3, next: 5 }).await;
        assert!(!election.is_master());
        assert_eq!(election.watch().fencing_token(), None);

        // the lease is free at once, without waiting for it to run out
        assert_eq!(standby.tick().await, Role::Master);
    }
}
