//! Value types shared by the fleet controller, its collaborators and the nodes it manages:
//! node identities, node states, versioned cluster states with their wire format, and the
//! bundles that get published.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod bundle;
mod cluster_state;
mod error;
mod feed_block;
mod node;
mod wire_state;

pub use bundle::ClusterStateBundle;
pub use cluster_state::{ClusterState, DEFAULT_DISTRIBUTION_BITS};
pub use error::{BundleError, StateParseError};
pub use feed_block::{FeedBlockStatus, ResourceExhaustion, ResourceUsage};
pub use node::{NodeId, NodeType};
pub use wire_state::WireState;

/// Reserved key for the baseline state in per space maps.
pub const BASELINE_SPACE: &str = "BASELINE";

/// Bucket space holding ordinary documents.
pub const DEFAULT_SPACE: &str = "default";

/// Bucket space holding globally replicated documents.
pub const GLOBAL_SPACE: &str = "global";
