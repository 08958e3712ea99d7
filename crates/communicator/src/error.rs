//! Error types for node communication

use std::error::Error;
use std::fmt::{self, Debug};
use std::time::Duration;

use thiserror::Error as ThisError;

/// Marker trait for `NodeCommunicator` errors
pub trait CommunicatorError: Debug + Error + Send + Sync + 'static {
    /// Returns the kind of this error
    fn kind(&self) -> CommunicatorErrorKind;
}

/// The kind of communicator error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommunicatorErrorKind {
    /// The node did not answer in time.
    Timeout,

    /// The node could not be reached at all.
    Unreachable,

    /// The node answered but refused the request (stale token or version).
    Rejected,

    /// Other/unknown error
    Other,
}

impl fmt::Display for CommunicatorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Failure of a deadline bounded RPC.
#[derive(Debug, ThisError)]
pub enum RpcError<E> {
    /// The deadline passed before the node answered.
    #[error("no answer within {0:?}")]
    TimedOut(Duration),

    /// The communicator reported an error.
    #[error(transparent)]
    Node(E),
}

impl<E: CommunicatorError> CommunicatorError for RpcError<E> {
    fn kind(&self) -> CommunicatorErrorKind {
        match self {
            Self::TimedOut(_) => CommunicatorErrorKind::Timeout,
            Self::Node(e) => e.kind(),
        }
    }
}
