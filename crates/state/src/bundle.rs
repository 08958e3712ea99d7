//! Baseline state plus per bucket space derived states

use std::collections::BTreeMap;

use indexmap::IndexMap;

use crate::error::BundleError;
use crate::{BASELINE_SPACE, ClusterState, FeedBlockStatus};

/// The unit the controller publishes and nodes acknowledge.
///
/// Every contained state carries the same version. Bundles are immutable; restamping
/// produces a new value.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterStateBundle {
    baseline: ClusterState,
    derived: BTreeMap<String, ClusterState>,
    feed_block: Option<FeedBlockStatus>,
}

impl ClusterStateBundle {
    /// Assembles a bundle.
    ///
    /// # Errors
    ///
    /// Fails when a derived state's version differs from the baseline's, or a derived
    /// space uses the reserved baseline name.
    pub fn new(
        baseline: ClusterState,
        derived: BTreeMap<String, ClusterState>,
        feed_block: Option<FeedBlockStatus>,
    ) -> Result<Self, BundleError> {
        for (space, state) in &derived {
            if space == BASELINE_SPACE {
                return Err(BundleError::ReservedSpaceName(space.clone()));
            }

            if state.version() != baseline.version() {
                return Err(BundleError::VersionMismatch {
                    space: space.clone(),
                    expected: baseline.version(),
                    found: state.version(),
                });
            }
        }

        Ok(Self {
            baseline,
            derived,
            feed_block,
        })
    }

    /// Bundle with only a baseline state.
    #[must_use]
    pub const fn baseline_only(baseline: ClusterState) -> Self {
        Self {
            baseline,
            derived: BTreeMap::new(),
            feed_block: None,
        }
    }

    /// Version shared by every contained state.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.baseline.version()
    }

    /// The baseline state.
    #[must_use]
    pub const fn baseline(&self) -> &ClusterState {
        &self.baseline
    }

    /// Derived states by bucket space name.
    #[must_use]
    pub const fn derived(&self) -> &BTreeMap<String, ClusterState> {
        &self.derived
    }

    /// State for a bucket space, falling back to the baseline for unknown spaces.
    #[must_use]
    pub fn state_for_space(&self, space: &str) -> &ClusterState {
        self.derived.get(space).unwrap_or(&self.baseline)
    }

    /// Feed block status, if evaluated.
    #[must_use]
    pub const fn feed_block(&self) -> Option<&FeedBlockStatus> {
        self.feed_block.as_ref()
    }

    /// Copy with every state restamped to `version`.
    #[must_use]
    pub fn with_version(&self, version: u64) -> Self {
        Self {
            baseline: self.baseline.clone().with_version(version),
            derived: self
                .derived
                .iter()
                .map(|(space, state)| (space.clone(), state.clone().with_version(version)))
                .collect(),
            feed_block: self.feed_block.clone(),
        }
    }

    /// Whether publishing `self` after `other` would tell nodes anything new. Versions
    /// are ignored; feed block statuses are compared by similarity.
    #[must_use]
    pub fn differs_materially(&self, other: &Self) -> bool {
        if !self.baseline.same_states(&other.baseline) {
            return true;
        }

        if self.derived.len() != other.derived.len() {
            return true;
        }

        let derived_differs = self.derived.iter().any(|(space, state)| {
            other
                .derived
                .get(space)
                .is_none_or(|theirs| !state.same_states(theirs))
        });
        if derived_differs {
            return true;
        }

        let unblocked = FeedBlockStatus::not_blocked();
        let mine = self.feed_block.as_ref().unwrap_or(&unblocked);
        let theirs = other.feed_block.as_ref().unwrap_or(&unblocked);
        !mine.similar_to(theirs)
    }

    /// Wire strings keyed by space, baseline first then derived spaces by name.
    #[must_use]
    pub fn raw_states_by_space(&self) -> IndexMap<String, String> {
        let mut raw = IndexMap::with_capacity(self.derived.len() + 1);
        raw.insert(BASELINE_SPACE.to_string(), self.baseline.to_string());
        for (space, state) in &self.derived {
            raw.insert(space.clone(), state.to_string());
        }
        raw
    }

    /// Per space change descriptions from `previous` to `self`, in the same order as
    /// [`raw_states_by_space`](Self::raw_states_by_space).
    #[must_use]
    pub fn diff_by_space(&self, previous: &Self) -> IndexMap<String, String> {
        let mut diffs = IndexMap::with_capacity(self.derived.len() + 1);
        diffs.insert(
            BASELINE_SPACE.to_string(),
            previous.baseline.describe_diff(&self.baseline),
        );
        for (space, state) in &self.derived {
            diffs.insert(
                space.clone(),
                previous.state_for_space(space).describe_diff(state),
            );
        }
        diffs
    }
}
