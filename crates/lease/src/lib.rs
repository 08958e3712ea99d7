//! Abstract interface for the lease that decides which controller replica is master.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::cmp::Ordering;
use std::error::Error;
use std::fmt::{self, Debug};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Marker trait for `LeaseStore` errors
pub trait LeaseStoreError: Debug + Error + Send + Sync + 'static {}

/// Proof of mastership attached to everything a master publishes.
///
/// Tokens are totally ordered by `sequence`. Every successful acquisition, by any
/// replica, yields a sequence strictly larger than all earlier ones, so a node that has
/// seen a newer token can reject traffic from a deposed master.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct FencingToken {
    /// Index of the controller replica the token was issued to.
    pub holder: u16,

    /// Store-wide acquisition sequence number.
    pub sequence: u64,
}

impl FencingToken {
    /// Creates a token.
    #[must_use]
    pub const fn new(holder: u16, sequence: u64) -> Self {
        Self { holder, sequence }
    }
}

impl Ord for FencingToken {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then(self.holder.cmp(&other.holder))
    }
}

impl PartialOrd for FencingToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@controller.{}", self.sequence, self.holder)
    }
}

/// A granted lease.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Lease {
    /// Token identifying this grant.
    pub token: FencingToken,

    /// How long the grant lasts from the moment it was requested, unless renewed.
    pub ttl: Duration,
}

/// Store holding the single mastership lease shared by all controller replicas.
///
/// Implementations must guarantee that at most one unexpired lease exists at any time and
/// that lease expiry as seen by the store is never earlier than `request time + ttl` as seen
/// by the requester.
#[async_trait]
pub trait LeaseStore: Clone + Send + Sync + 'static {
    /// The error type for lease operations.
    type Error: LeaseStoreError;

    /// Attempts to acquire the lease for controller `candidate` without waiting.
    ///
    /// Returns `Ok(None)` if the lease is held by someone else. A bid from a lower index
    /// than the current holder is remembered and makes the holder's next renewal fail.
    async fn try_acquire(&self, candidate: u16) -> Result<Option<Lease>, Self::Error>;

    /// Extends the lease held under `token` by another TTL.
    ///
    /// Returns `false` if the token is no longer the current holder or has been
    /// preempted; the caller must stop acting as master.
    async fn renew(&self, token: &FencingToken) -> Result<bool, Self::Error>;

    /// Gives the lease up early. Releasing a token that is not current is a no-op.
    async fn release(&self, token: &FencingToken) -> Result<(), Self::Error>;

    /// Token of the current unexpired holder, if any.
    async fn holder(&self) -> Result<Option<FencingToken>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_order_by_sequence() {
        assert!(FencingToken::new(5, 2) > FencingToken::new(0, 1));
        assert!(FencingToken::new(0, 3) > FencingToken::new(9, 2));
        assert_eq!(FencingToken::new(1, 7).to_string(), "7@controller.1");
    }
}
