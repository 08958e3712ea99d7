use fleet_state::{ResourceUsage, WireState};

/// Health bookkeeping for a single node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeHealthRecord {
    pub(super) last_reported_state: WireState,
    pub(super) last_reported_at_ms: Option<u64>,
    pub(super) reported_since_ms: u64,
    pub(super) consecutive_failures: u32,
    pub(super) effective_state: WireState,
    pub(super) wanted_state: Option<WireState>,
    pub(super) resource_usage: ResourceUsage,
    pub(super) resource_usage_at_ms: Option<u64>,
    pub(super) acked_version: u64,
}

impl NodeHealthRecord {
    /// A node that has not reported anything yet counts as down.
    pub(super) fn new(now_ms: u64) -> Self {
        Self {
            last_reported_state: WireState::Down,
            last_reported_at_ms: None,
            reported_since_ms: now_ms,
            consecutive_failures: 0,
            effective_state: WireState::Down,
            wanted_state: None,
            resource_usage: ResourceUsage::new(),
            resource_usage_at_ms: None,
            acked_version: 0,
        }
    }

    /// Records a report. Returns false if it is older than one already accepted.
    pub(super) fn record_reported(&mut self, state: WireState, at_ms: u64) -> bool {
        if self.last_reported_at_ms.is_some_and(|last| at_ms < last) {
            return false;
        }

        if state != self.last_reported_state {
            self.last_reported_state = state;
            self.reported_since_ms = at_ms;
        }
        self.last_reported_at_ms = Some(at_ms);

        true
    }

    /// Promotes the reported state once it has held long enough.
    pub(super) fn stabilize(&mut self, now_ms: u64, stable_period_ms: u64) -> Option<WireState> {
        if self.last_reported_state == self.effective_state {
            return None;
        }

        if now_ms.saturating_sub(self.reported_since_ms) < stable_period_ms {
            return None;
        }

        let previous = self.effective_state;
        self.effective_state = self.last_reported_state;
        Some(previous)
    }

    /// Latest state the node reported, or was assumed to report.
    #[must_use]
    pub const fn reported_state(&self) -> WireState {
        self.last_reported_state
    }

    /// When the last accepted report arrived.
    #[must_use]
    pub const fn last_reported_at_ms(&self) -> Option<u64> {
        self.last_reported_at_ms
    }

    /// When the reported state last changed value.
    #[must_use]
    pub const fn reported_since_ms(&self) -> u64 {
        self.reported_since_ms
    }

    /// Failed pings since the last successful report.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Reported state after hysteresis.
    #[must_use]
    pub const fn effective_state(&self) -> WireState {
        self.effective_state
    }

    /// Operator override, if any.
    #[must_use]
    pub const fn wanted_state(&self) -> Option<WireState> {
        self.wanted_state
    }

    /// Latest resource usage.
    #[must_use]
    pub const fn resource_usage(&self) -> &ResourceUsage {
        &self.resource_usage
    }

    /// Highest cluster state version the node said it acknowledged.
    #[must_use]
    pub const fn acked_version(&self) -> u64 {
        self.acked_version
    }

    /// State the node gets in the cluster state: the effective state with the operator
    /// override applied on top.
    ///
    /// | wanted | resolved |
    /// |---|---|
    /// | `Down` | `Down` |
    /// | `Maintenance` | `Maintenance` |
    /// | `Retired` | `Retired` if effective is available, else effective |
    /// | `Up` / none | effective |
    #[must_use]
    pub const fn resolved_state(&self) -> WireState {
        match self.wanted_state {
            Some(WireState::Down) => WireState::Down,
            Some(WireState::Maintenance) => WireState::Maintenance,
            Some(WireState::Retired) if self.effective_state.is_available() => WireState::Retired,
            _ => self.effective_state,
        }
    }
}
