//! Master election among controller replicas
//!
//! Mastership is a lease in a [`LeaseStore`]. A replica considers itself master only while
//! it holds a fencing token whose local validity deadline (request time + TTL) has not
//! passed; any store error drops it back to candidate. The lowest index replica that can
//! reach the store ends up master: its bids against a higher index holder make that
//! holder's next renewal fail.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use fleet_lease::{FencingToken, LeaseStore};
use fleet_util::Clock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};

/// Role of a controller replica.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Trying to become master.
    Candidate,

    /// Holding the lease.
    Master,

    /// Another replica holds the lease.
    Follower,
}

/// Election state as published to readers.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MasterStatus {
    /// Role of this replica.
    pub role: Role,

    /// Index of this replica.
    pub my_index: u16,

    /// Index of the known lease holder.
    pub master_index: Option<u16>,

    /// Token held while master.
    pub token: Option<FencingToken>,

    /// Local deadline after which the token must no longer be used.
    pub valid_until_ms: u64,
}

impl MasterStatus {
    const fn candidate(my_index: u16) -> Self {
        Self {
            role: Role::Candidate,
            my_index,
            master_index: None,
            token: None,
            valid_until_ms: 0,
        }
    }

    /// Whether this status grants mastership at `now_ms`.
    #[must_use]
    pub const fn is_master_at(&self, now_ms: u64) -> bool {
        matches!(self.role, Role::Master) && self.token.is_some() && now_ms < self.valid_until_ms
    }
}

fn rank_among(reachable: &BTreeSet<u16>, my_index: u16) -> usize {
    reachable.iter().filter(|index| **index < my_index).count()
}

/// Cloneable read-only view of the election, for other tasks.
#[derive(Clone, Debug)]
pub struct MasterWatch {
    status: Arc<ArcSwap<MasterStatus>>,
    reachable: Arc<ArcSwap<BTreeSet<u16>>>,
    clock: Arc<dyn Clock>,
}

impl MasterWatch {
    /// Latest published status.
    #[must_use]
    pub fn status(&self) -> Arc<MasterStatus> {
        self.status.load_full()
    }

    /// Whether this replica currently holds a valid, unexpired token.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.status.load().is_master_at(self.clock.now_ms())
    }

    /// The token while master.
    #[must_use]
    pub fn fencing_token(&self) -> Option<FencingToken> {
        let status = self.status.load();
        if status.is_master_at(self.clock.now_ms()) {
            status.token
        } else {
            None
        }
    }

    /// Index of the known master.
    #[must_use]
    pub fn master_index(&self) -> Option<u16> {
        self.status.load().master_index
    }

    /// Role of this replica.
    #[must_use]
    pub fn role(&self) -> Role {
        self.status.load().role
    }

    /// Whether fewer than `n` reachable replicas have a lower index than this one.
    #[must_use]
    pub fn is_among_nth_first(&self, n: usize) -> bool {
        let my_index = self.status.load().my_index;
        rank_among(&self.reachable.load(), my_index) < n
    }
}

/// Drives this replica's side of the election.
#[derive(Debug)]
pub struct MasterElectionHandler<L>
where
    L: LeaseStore,
{
    store: L,
    my_index: u16,
    clock: Arc<dyn Clock>,
    status: Arc<ArcSwap<MasterStatus>>,
    reachable: Arc<ArcSwap<BTreeSet<u16>>>,
    lease_ttl_ms: AtomicU64,
}

impl<L> MasterElectionHandler<L>
where
    L: LeaseStore,
{
    /// Creates a handler for replica `my_index` of `controller_count`. All replicas are
    /// assumed reachable until told otherwise.
    pub fn new(store: L, my_index: u16, controller_count: u16, clock: Arc<dyn Clock>) -> Self {
        let mut reachable: BTreeSet<u16> = (0..controller_count).collect();
        reachable.insert(my_index);

        Self {
            store,
            my_index,
            clock,
            status: Arc::new(ArcSwap::from_pointee(MasterStatus::candidate(my_index))),
            reachable: Arc::new(ArcSwap::from_pointee(reachable)),
            lease_ttl_ms: AtomicU64::new(0),
        }
    }

    /// Read-only view sharing this handler's state.
    #[must_use]
    pub fn watch(&self) -> MasterWatch {
        MasterWatch {
            status: self.status.clone(),
            reachable: self.reachable.clone(),
            clock: self.clock.clone(),
        }
    }

    pub(crate) fn reachable_controllers(&self) -> Arc<ArcSwap<BTreeSet<u16>>> {
        self.reachable.clone()
    }

    /// Latest status.
    #[must_use]
    pub fn status(&self) -> Arc<MasterStatus> {
        self.status.load_full()
    }

    /// Current role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.status.load().role
    }

    /// Whether this replica currently holds a valid, unexpired token.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.status.load().is_master_at(self.clock.now_ms())
    }

    /// The token while master.
    #[must_use]
    pub fn fencing_token(&self) -> Option<FencingToken> {
        self.watch().fencing_token()
    }

    /// Index of the known master.
    #[must_use]
    pub fn master_index(&self) -> Option<u16> {
        self.status.load().master_index
    }

    /// Whether fewer than `n` reachable replicas have a lower index than this one.
    #[must_use]
    pub fn is_among_nth_first(&self, n: usize) -> bool {
        rank_among(&self.reachable.load(), self.my_index) < n
    }

    /// Replaces the set of replicas this one can currently talk to. This replica is
    /// always included.
    pub fn set_reachable_controllers(&self, reachable: BTreeSet<u16>) {
        let mut reachable = reachable;
        reachable.insert(self.my_index);
        self.reachable.store(Arc::new(reachable));
    }

    fn publish(&self, status: MasterStatus) {
        let previous = self.status.swap(Arc::new(status.clone()));

        match (previous.role, status.role) {
            (Role::Master, Role::Master) => {}
            (Role::Master, _) => {
                warn!(
                    role = ?status.role,
                    master = ?status.master_index,
                    "lost mastership"
                );
            }
            (_, Role::Master) => {
                info!(token = ?status.token, "gained mastership");
            }
            (from, to) if from != to || previous.master_index != status.master_index => {
                debug!(?from, ?to, master = ?status.master_index, "election state changed");
            }
            _ => {}
        }
    }

    /// One election round: renew while master, otherwise try to acquire.
    #[instrument(skip(self), fields(controller = self.my_index))]
    pub async fn tick(&self) -> Role {
        let issued_at_ms = self.clock.now_ms();
        let current = self.status.load_full();

        if let (Role::Master, Some(token)) = (current.role, current.token) {
            if issued_at_ms < current.valid_until_ms {
                match self.store.renew(&token).await {
                    Ok(true) => {
                        let ttl_ms = self.lease_ttl_ms.load(Ordering::Relaxed);
                        self.publish(MasterStatus {
                            valid_until_ms: issued_at_ms.saturating_add(ttl_ms),
                            ..(*current).clone()
                        });
                        return Role::Master;
                    }
                    Ok(false) => {
                        warn!(%token, "lease renewal refused");
                    }
                    Err(e) => {
                        warn!(%token, "lease renewal failed: {}", e);
                        self.publish(MasterStatus::candidate(self.my_index));
                        return Role::Candidate;
                    }
                }
            } else {
                warn!(%token, "lease expired locally before renewal");
            }
        }

        self.acquire(issued_at_ms).await
    }

    async fn acquire(&self, issued_at_ms: u64) -> Role {
        match self.store.try_acquire(self.my_index).await {
            Ok(Some(lease)) => {
                let ttl_ms = u64::try_from(lease.ttl.as_millis()).unwrap_or(u64::MAX);
                self.lease_ttl_ms.store(ttl_ms, Ordering::Relaxed);
                self.publish(MasterStatus {
                    role: Role::Master,
                    my_index: self.my_index,
                    master_index: Some(self.my_index),
                    token: Some(lease.token),
                    valid_until_ms: issued_at_ms.saturating_add(ttl_ms),
                });
                Role::Master
            }
            Ok(None) => match self.store.holder().await {
                Ok(Some(holder)) if holder.holder != self.my_index => {
                    self.publish(MasterStatus {
                        role: Role::Follower,
                        master_index: Some(holder.holder),
                        ..MasterStatus::candidate(self.my_index)
                    });
                    Role::Follower
                }
                Ok(_) => {
                    // free, or our own lease running out after losing it
                    self.publish(MasterStatus::candidate(self.my_index));
                    Role::Candidate
                }
                Err(e) => {
                    warn!("failed to look up lease holder: {}", e);
                    self.publish(MasterStatus::candidate(self.my_index));
                    Role::Candidate
                }
            },
            Err(e) => {
                warn!("lease acquisition failed: {}", e);
                self.publish(MasterStatus::candidate(self.my_index));
                Role::Candidate
            }
        }
    }

    /// Gives up mastership and releases the lease.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lease`] if the store could not be told; mastership is dropped
    /// locally either way.
    #[instrument(skip(self), fields(controller = self.my_index))]
    pub async fn resign(&self) -> Result<()> {
        let current = self.status.load_full();
        self.publish(MasterStatus::candidate(self.my_index));

        if let (Role::Master, Some(token)) = (current.role, current.token) {
            info!(%token, "resigning mastership");
            self.store
                .release(&token)
                .await
                .map_err(|e| Error::Lease(e.to_string()))?;
        }

        Ok(())
    }
}
