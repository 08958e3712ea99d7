//! Cluster state versioning and history

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use fleet_state::{ClusterState, ClusterStateBundle};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::options::FleetControllerOptions;

/// One published version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStateHistoryEntry {
    /// Published version.
    pub version: u64,

    /// When it was published.
    pub timestamp_ms: u64,

    /// Wire form per space, baseline first.
    pub raw_states_by_space: IndexMap<String, String>,

    /// Change from the previous version per space, baseline first.
    pub diff_by_space: IndexMap<String, String>,
}

/// What [`StateVersionTracker::publish`] did with a candidate.
#[derive(Clone, Debug, PartialEq)]
pub enum PublishOutcome {
    /// The candidate became the current bundle.
    Published(Arc<ClusterStateBundle>),

    /// The candidate matched the current bundle and was dropped.
    Unchanged,
}

/// Assigns versions to candidate bundles and keeps the publication history.
///
/// Versions never repeat and never go backwards, including across a change of master:
/// the new master learns the highest version any node acknowledged through
/// [`observe_version`](Self::observe_version) before publishing.
#[derive(Debug)]
pub struct StateVersionTracker {
    current: Arc<ClusterStateBundle>,
    version_floor: u64,
    history: VecDeque<Arc<ClusterStateHistoryEntry>>,
    max_history_entries: usize,
    max_history_age_ms: Option<u64>,
}

impl StateVersionTracker {
    /// Creates a tracker whose current bundle is version 0 with the cluster down.
    #[must_use]
    pub fn new(max_history_entries: usize, max_history_age: Option<Duration>) -> Self {
        let mut initial = ClusterState::new(0);
        initial.set_cluster_up(false);

        Self {
            current: Arc::new(ClusterStateBundle::baseline_only(initial)),
            version_floor: 0,
            history: VecDeque::new(),
            max_history_entries: max_history_entries.max(1),
            max_history_age_ms: max_history_age
                .map(|age| u64::try_from(age.as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Creates a tracker with the configured history retention.
    #[must_use]
    pub fn from_options(options: &FleetControllerOptions) -> Self {
        Self::new(options.max_history_entries, options.max_history_age)
    }

    /// Latest published bundle.
    #[must_use]
    pub fn current_bundle(&self) -> Arc<ClusterStateBundle> {
        self.current.clone()
    }

    /// Version of the latest published bundle.
    #[must_use]
    pub fn current_version(&self) -> u64 {
        self.current.version()
    }

    /// Version the next publication gets.
    #[must_use]
    pub fn next_version(&self) -> u64 {
        self.current.version().max(self.version_floor) + 1
    }

    /// Raises the floor for future versions to at least `version`.
    pub fn observe_version(&mut self, version: u64) {
        if version > self.version_floor {
            debug!(version, "raising version floor");
            self.version_floor = version;
        }
    }

    /// Publishes a candidate.
    ///
    /// Candidates that do not differ materially from the current bundle are dropped
    /// unless `force` is set. A candidate with version 0 is stamped with
    /// [`next_version`](Self::next_version).
    ///
    /// # Errors
    ///
    /// Returns [`Error::VersionRegression`] for a nonzero version below the next version.
    pub fn publish(
        &mut self,
        candidate: ClusterStateBundle,
        now_ms: u64,
        force: bool,
    ) -> Result<PublishOutcome> {
        if !force && !candidate.differs_materially(&self.current) {
            return Ok(PublishOutcome::Unchanged);
        }

        let next = self.next_version();
        let bundle = match candidate.version() {
            0 => candidate.with_version(next),
            version if version < next => {
                return Err(Error::VersionRegression {
                    attempted: version,
                    next,
                });
            }
            _ => candidate,
        };

        let entry = ClusterStateHistoryEntry {
            version: bundle.version(),
            timestamp_ms: now_ms,
            raw_states_by_space: bundle.raw_states_by_space(),
            diff_by_space: bundle.diff_by_space(&self.current),
        };

        info!(
            version = bundle.version(),
            state = %bundle.baseline(),
            "publishing cluster state"
        );

        self.history.push_front(Arc::new(entry));
        self.prune_history(now_ms);
        self.current = Arc::new(bundle);

        Ok(PublishOutcome::Published(self.current.clone()))
    }

    fn prune_history(&mut self, now_ms: u64) {
        self.history.truncate(self.max_history_entries);

        if let Some(max_age_ms) = self.max_history_age_ms {
            while self.history.len() > 1
                && self
                    .history
                    .back()
                    .is_some_and(|oldest| now_ms.saturating_sub(oldest.timestamp_ms) > max_age_ms)
            {
                self.history.pop_back();
            }
        }
    }

    /// Published versions, newest first.
    #[must_use]
    pub fn history(&self) -> Vec<Arc<ClusterStateHistoryEntry>> {
        self.history.iter().cloned().collect()
    }
}
