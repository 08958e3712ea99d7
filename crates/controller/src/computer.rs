//! The control loop: from node reports to delivered cluster states

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use fleet_communicator::{CommunicatorError, NodeCommunicator, NodeReport};
use fleet_lease::FencingToken;
use fleet_state::{BASELINE_SPACE, ClusterStateBundle, NodeId, WireState};
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::derivation::derive_bundle;
use crate::election::MasterWatch;
use crate::error::{Error, Result};
use crate::event_log::{EventKind, EventLog};
use crate::feed_block::FeedBlockEvaluator;
use crate::node_state::{NodeStateSnapshot, NodeStateTracker};
use crate::options::{FleetControllerOptions, TopologyOptions};
use crate::version::{ClusterStateHistoryEntry, PublishOutcome, StateVersionTracker};

/// Input consumed by the control loop.
#[derive(Clone, Debug)]
pub enum ControllerInput {
    /// A node answered a ping.
    NodeReport {
        /// Reporting node.
        node: NodeId,
        /// What it said.
        report: NodeReport,
        /// When the answer arrived.
        at_ms: u64,
    },

    /// A ping failed or timed out.
    PingFailure {
        /// Node that did not answer.
        node: NodeId,
        /// Why.
        reason: String,
        /// When the failure was noticed.
        at_ms: u64,
    },

    /// Operator override set or cleared.
    WantedState {
        /// Target node.
        node: NodeId,
        /// New override, `None` clears it.
        state: Option<WireState>,
        /// When it was requested.
        at_ms: u64,
    },

    /// New topology.
    Reconfigure {
        /// The topology to switch to.
        topology: TopologyOptions,
        /// When it was requested.
        at_ms: u64,
    },
}

/// Result of one control loop pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TickOutcome {
    /// This replica is not master; node states were still updated.
    NotMaster,

    /// Mastership went away during the pass; results of the pass were discarded.
    MastershipLost,

    /// Pass completed as master.
    Master {
        /// Current version after the pass.
        version: u64,
        /// Whether a new version was published in this pass.
        published: bool,
        /// Nodes that acknowledged the current version in this pass.
        delivered: usize,
        /// Nodes the current version could not be delivered to in this pass.
        failed: usize,
    },
}

/// Single writer owning node state tracking, versioning and delivery.
#[derive(Debug)]
pub struct ClusterStateComputer<C>
where
    C: NodeCommunicator,
{
    options: FleetControllerOptions,
    communicator: C,
    tracker: NodeStateTracker,
    versions: StateVersionTracker,
    evaluator: FeedBlockEvaluator,
    events: EventLog,
    delivered: BTreeMap<NodeId, u64>,
    active_token: Option<FencingToken>,
}

impl<C> ClusterStateComputer<C>
where
    C: NodeCommunicator,
{
    /// Creates the control loop state for validated `options`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the options are inconsistent.
    pub fn new(options: FleetControllerOptions, communicator: C, now_ms: u64) -> Result<Self> {
        options.validate()?;

        Ok(Self {
            tracker: NodeStateTracker::from_options(&options, now_ms),
            versions: StateVersionTracker::from_options(&options),
            evaluator: FeedBlockEvaluator::new(&options.feed_block),
            events: EventLog::new(options.max_event_log_size),
            delivered: BTreeMap::new(),
            active_token: None,
            options,
            communicator,
        })
    }

    /// Current options.
    #[must_use]
    pub const fn options(&self) -> &FleetControllerOptions {
        &self.options
    }

    /// Node state tracker.
    #[must_use]
    pub const fn tracker(&self) -> &NodeStateTracker {
        &self.tracker
    }

    /// Event log.
    #[must_use]
    pub const fn events(&self) -> &EventLog {
        &self.events
    }

    /// Latest published bundle.
    #[must_use]
    pub fn current_bundle(&self) -> Arc<ClusterStateBundle> {
        self.versions.current_bundle()
    }

    /// Publication history, newest first.
    #[must_use]
    pub fn history(&self) -> Vec<Arc<ClusterStateHistoryEntry>> {
        self.versions.history()
    }

    /// Snapshot of every node's state.
    #[must_use]
    pub fn node_snapshot(&self) -> Arc<NodeStateSnapshot> {
        self.tracker.snapshot()
    }

    /// Version each node acknowledged under the current mastership.
    #[must_use]
    pub const fn delivered_versions(&self) -> &BTreeMap<NodeId, u64> {
        &self.delivered
    }

    /// Consumes one input.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for a reconfiguration to an invalid topology,
    /// which is then ignored.
    pub fn apply(&mut self, input: ControllerInput) -> Result<()> {
        match input {
            ControllerInput::NodeReport {
                node,
                report,
                at_ms,
            } => self.apply_report(node, report, at_ms),
            ControllerInput::PingFailure {
                node,
                reason,
                at_ms,
            } => {
                debug!(%node, "ping failed: {}", reason);
                self.tracker.report_ping_failure(node, at_ms);
            }
            ControllerInput::WantedState { node, state, at_ms } => {
                if self.tracker.set_wanted_state(node, state) {
                    let description = state.map_or_else(
                        || "wanted state cleared".to_string(),
                        |state| format!("wanted state set to {state}"),
                    );
                    info!(%node, "{}", description);
                    self.events
                        .record(at_ms, EventKind::WantedStateChange, Some(node), description);
                }
            }
            ControllerInput::Reconfigure { topology, at_ms } => {
                let mut options = self.options.clone();
                options.topology = topology;
                options.validate()?;

                let nodes = options.topology.nodes();
                info!(nodes = nodes.len(), "applying new topology");
                self.tracker.reconfigure(nodes.iter().copied(), at_ms);
                self.delivered.retain(|node, _| nodes.contains(node));
                self.options = options;
            }
        }

        Ok(())
    }

    fn apply_report(&mut self, node: NodeId, report: NodeReport, at_ms: u64) {
        if self
            .delivered
            .get(&node)
            .is_some_and(|delivered| report.acked_version < *delivered)
        {
            info!(
                %node,
                acked = report.acked_version,
                "node lost its cluster state, delivering again"
            );
            self.delivered.remove(&node);
        }

        self.tracker.report_state(node, report.state, at_ms);
        self.tracker.report_acked_version(node, report.acked_version);
        self.tracker
            .report_resource_usage(node, report.resource_usage, at_ms);
    }

    /// One control loop pass.
    ///
    /// Node states are updated whether or not this replica is master. As master, a
    /// candidate bundle is derived and published if it changed, then delivered to every
    /// node that has not acknowledged it yet. Mastership is checked before and after all
    /// node I/O; if it is gone the pass returns [`TickOutcome::MastershipLost`] and its
    /// delivery results are thrown away.
    ///
    /// # Errors
    ///
    /// Returns an error only for internal inconsistencies (a bundle that cannot be
    /// assembled, a version regression). The caller must stop acting as master.
    #[instrument(skip(self, master))]
    pub async fn tick(&mut self, now_ms: u64, master: &MasterWatch) -> Result<TickOutcome> {
        self.update_node_states(now_ms);

        let Some(token) = master.fencing_token() else {
            self.step_down(now_ms);
            return Ok(TickOutcome::NotMaster);
        };

        match self.tick_as_master(now_ms, master, token).await {
            Err(Error::NotMaster) => {
                self.step_down(now_ms);
                Ok(TickOutcome::MastershipLost)
            }
            other => other,
        }
    }

    fn update_node_states(&mut self, now_ms: u64) {
        let before = self.tracker.effective_states();

        for node in self.tracker.tick(now_ms) {
            let Some(record) = self.tracker.record(&node) else {
                continue;
            };
            let from = before.get(&node).copied().unwrap_or(WireState::Down);
            self.events.record(
                now_ms,
                EventKind::NodeStateChange,
                Some(node),
                format!("{from} -> {}", record.effective_state()),
            );
        }
    }

    fn step_down(&mut self, now_ms: u64) {
        if let Some(token) = self.active_token.take() {
            warn!(%token, "no longer master, dropping delivery state");
            self.events.record(
                now_ms,
                EventKind::MastershipLost,
                None,
                format!("token {token} no longer valid"),
            );
        }
        self.delivered.clear();
    }

    async fn tick_as_master(
        &mut self,
        now_ms: u64,
        master: &MasterWatch,
        token: FencingToken,
    ) -> Result<TickOutcome> {
        let mut force = false;
        if self.active_token != Some(token) {
            self.take_over(now_ms, master, token).await?;
            force = true;
        }

        self.versions.observe_version(self.tracker.max_acked_version());

        let previous = self.versions.current_bundle();
        let candidate = derive_bundle(
            &self.options,
            &self.tracker.snapshot(),
            &self.evaluator,
            previous.feed_block(),
        )?;

        let published = match self.versions.publish(candidate, now_ms, force)? {
            PublishOutcome::Published(bundle) => {
                self.record_publication(&previous, &bundle, now_ms);
                true
            }
            PublishOutcome::Unchanged => false,
        };

        let bundle = self.versions.current_bundle();
        let (delivered, failed) = self.deliver(&bundle, now_ms, master, token).await?;

        Ok(TickOutcome::Master {
            version: bundle.version(),
            published,
            delivered,
            failed,
        })
    }

    /// Fresh mastership: learn the highest version any node has acknowledged so the
    /// first publication under the new token continues from there.
    async fn take_over(
        &mut self,
        now_ms: u64,
        master: &MasterWatch,
        token: FencingToken,
    ) -> Result<()> {
        info!(%token, "taking over as master");
        self.delivered.clear();

        let nodes: Vec<NodeId> = self.tracker.nodes().collect();
        let timeout = self.options.ping_timeout;
        let communicator = &self.communicator;
        let pings = nodes.iter().map(|&node| async move {
            (node, communicator.ping_with_deadline(node, timeout).await)
        });
        let results = join_all(pings).await;

        ensure_master(master, token)?;

        for (node, result) in results {
            match result {
                Ok(report) => self.apply_report(node, report, now_ms),
                Err(e) => {
                    debug!(%node, "version query failed: {}", e);
                    self.tracker.report_ping_failure(node, now_ms);
                }
            }
        }

        let floor = self.tracker.max_acked_version();
        self.versions.observe_version(floor);
        self.active_token = Some(token);
        self.events.record(
            now_ms,
            EventKind::MastershipGained,
            None,
            format!("token {token}, highest acknowledged version {floor}"),
        );

        Ok(())
    }

    fn record_publication(
        &mut self,
        previous: &ClusterStateBundle,
        bundle: &ClusterStateBundle,
        now_ms: u64,
    ) {
        let diff = bundle
            .diff_by_space(previous)
            .swap_remove(BASELINE_SPACE)
            .filter(|diff| !diff.is_empty())
            .unwrap_or_else(|| "no baseline changes".to_string());
        self.events.record(
            now_ms,
            EventKind::PublishedVersion,
            None,
            format!("version {}: {diff}", bundle.version()),
        );

        let was_blocked = previous.feed_block().is_some_and(|status| status.blocked);
        let blocked = bundle.feed_block().filter(|status| status.blocked);
        match (was_blocked, blocked) {
            (false, Some(status)) => {
                warn!(version = bundle.version(), "feed blocked: {}", status.description);
                self.events.record(
                    now_ms,
                    EventKind::FeedBlockChange,
                    None,
                    format!("feed blocked: {}", status.description),
                );
            }
            (true, None) => {
                info!(version = bundle.version(), "feed unblocked");
                self.events
                    .record(now_ms, EventKind::FeedBlockChange, None, "feed unblocked");
            }
            (true, Some(status)) if !previous.feed_block().is_some_and(|p| status.similar_to(p)) => {
                self.events.record(
                    now_ms,
                    EventKind::FeedBlockChange,
                    None,
                    format!("feed still blocked: {}", status.description),
                );
            }
            _ => {}
        }
    }

    /// Delivers `bundle` to every reporting node that has not acknowledged it under the
    /// current token. Failed nodes are retried next pass.
    async fn deliver(
        &mut self,
        bundle: &Arc<ClusterStateBundle>,
        now_ms: u64,
        master: &MasterWatch,
        token: FencingToken,
    ) -> Result<(usize, usize)> {
        let version = bundle.version();
        let targets: Vec<NodeId> = self
            .tracker
            .nodes()
            .filter(|node| {
                self.tracker
                    .record(node)
                    .is_some_and(|record| record.reported_state() != WireState::Down)
            })
            .filter(|node| self.delivered.get(node).is_none_or(|acked| *acked < version))
            .collect();

        if targets.is_empty() {
            return Ok((0, 0));
        }

        ensure_master(master, token)?;
        let results = self
            .communicator
            .publish(&targets, bundle.clone(), token, self.options.publish_timeout)
            .await;
        ensure_master(master, token)?;

        let mut delivered = BTreeSet::new();
        let mut failed = 0;
        for (node, result) in results {
            match result {
                Ok(ack) => {
                    self.delivered.insert(node, ack.version);
                    self.tracker.report_acked_version(node, ack.version);
                    delivered.insert(node);
                }
                Err(e) => {
                    failed += 1;
                    warn!(%node, version, kind = %e.kind(), "failed to deliver cluster state: {}", e);
                    self.events.record(
                        now_ms,
                        EventKind::DeliveryFailure,
                        Some(node),
                        format!("version {version}: {e}"),
                    );
                }
            }
        }

        debug!(version, delivered = delivered.len(), failed, "delivery round done");

        Ok((delivered.len(), failed))
    }
}

fn ensure_master(master: &MasterWatch, token: FencingToken) -> Result<()> {
    if master.fencing_token() == Some(token) {
        Ok(())
    } else {
        Err(Error::NotMaster)
    }
}
