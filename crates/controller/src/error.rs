use fleet_state::BundleError;
use thiserror::Error;

/// The result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Controller already started.
    #[error("controller already started")]
    AlreadyStarted,

    /// Options are inconsistent.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A derived bundle could not be assembled.
    #[error(transparent)]
    InvalidBundle(#[from] BundleError),

    /// Lease store failure.
    #[error("lease store error: {0}")]
    Lease(String),

    /// The operation needs mastership this replica does not have.
    #[error("not master")]
    NotMaster,

    /// Controller has not been started.
    #[error("controller not started")]
    NotStarted,

    /// Controller is shutting down and no longer accepts input.
    #[error("controller is shutting down")]
    Shutdown,

    /// A candidate carried a version that would go backwards.
    #[error("version {attempted} is below next version {next}")]
    VersionRegression {
        /// Version on the candidate.
        attempted: u64,
        /// Lowest version that may be published.
        next: u64,
    },
}
