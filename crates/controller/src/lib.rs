//! Cluster controller that keeps a fleet of distributor and storage nodes converged on a
//! single authoritative, versioned cluster state.
//!
//! Replicas elect a master through a [`fleet_lease::LeaseStore`]. Every replica tracks node
//! health from pings; the master derives a cluster state bundle from it, publishes a new
//! version when the result changes materially, and delivers it to the nodes tagged with
//! its fencing token.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod computer;
mod derivation;
mod election;
mod error;
mod event_log;
mod feed_block;
mod node_state;
mod options;
mod service;
mod status;
mod version;

pub use computer::{ClusterStateComputer, ControllerInput, TickOutcome};
pub use derivation::derive_bundle;
pub use election::{MasterElectionHandler, MasterStatus, MasterWatch, Role};
pub use error::{Error, Result};
pub use event_log::{Event, EventKind, EventLog};
pub use feed_block::FeedBlockEvaluator;
pub use node_state::{NodeHealthRecord, NodeStateSnapshot, NodeStateTracker, NodeStateView};
pub use options::{
    BucketSpaceOptions, FeedBlockOptions, FleetControllerOptions, StorageGroup, TopologyOptions,
};
pub use service::{ControllerHandle, FleetController};
pub use status::{StatusSnapshot, StatusView};
pub use version::{ClusterStateHistoryEntry, PublishOutcome, StateVersionTracker};
