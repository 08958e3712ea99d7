use fleet_lease::LeaseStoreError;
use thiserror::Error;

/// Errors returned by the in-memory lease store.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The calling replica is partitioned away from the store.
    #[error("controller {0} cannot reach the lease store")]
    Unreachable(u16),
}

impl LeaseStoreError for Error {}
