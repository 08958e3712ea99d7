//! In-memory (single process) lease store for local development and simulations.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_lease::{FencingToken, Lease, LeaseStore};
use fleet_util::Clock;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct Held {
    token: FencingToken,
    expires_at_ms: u64,
}

/// After a preempted lease runs out, the lower index bidder gets the first chance at it.
#[derive(Debug)]
struct Reservation {
    candidate: u16,
    until_ms: u64,
}

#[derive(Debug, Default)]
struct State {
    held: Option<Held>,
    last_sequence: u64,
    preempted_by: Option<u16>,
    reservation: Option<Reservation>,
    unreachable: HashSet<u16>,
}

impl State {
    fn expire(&mut self, now_ms: u64, ttl_ms: u64) {
        if self.held.as_ref().is_some_and(|held| now_ms >= held.expires_at_ms) {
            self.held = None;
            if let Some(candidate) = self.preempted_by.take() {
                self.reservation = Some(Reservation {
                    candidate,
                    until_ms: now_ms.saturating_add(ttl_ms),
                });
            }
        }

        if self
            .reservation
            .as_ref()
            .is_some_and(|reservation| now_ms >= reservation.until_ms)
        {
            self.reservation = None;
        }
    }
}

/// In-memory lease store.
///
/// Clones share the same lease. [`connect`](Self::connect) hands out per replica handles
/// whose calls fail while that replica is marked unreachable, which is how simulations
/// model network partitions.
#[derive(Clone, Debug)]
pub struct MemoryLeaseStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    client: Option<u16>,
}

impl MemoryLeaseStore {
    /// Creates a store granting leases of `ttl`, reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
            ttl,
            client: None,
        }
    }

    /// Handle used by controller replica `client`.
    #[must_use]
    pub fn connect(&self, client: u16) -> Self {
        Self {
            client: Some(client),
            ..self.clone()
        }
    }

    /// Lease duration.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cuts replica `client` off from the store, or reconnects it.
    pub async fn set_reachable(&self, client: u16, reachable: bool) {
        let mut state = self.state.lock().await;
        if reachable {
            state.unreachable.remove(&client);
        } else {
            state.unreachable.insert(client);
        }
    }

    fn ttl_ms(&self) -> u64 {
        u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX)
    }

    async fn lock_for_client(&self) -> Result<tokio::sync::MutexGuard<'_, State>, Error> {
        let mut state = self.state.lock().await;

        if let Some(client) = self.client {
            if state.unreachable.contains(&client) {
                return Err(Error::Unreachable(client));
            }
        }

        state.expire(self.clock.now_ms(), self.ttl_ms());
        Ok(state)
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    type Error = Error;

    async fn try_acquire(&self, candidate: u16) -> Result<Option<Lease>, Self::Error> {
        let mut state = self.lock_for_client().await?;

        if let Some(holder) = state.held.as_ref().map(|held| held.token.holder) {
            if candidate < holder {
                let bid = state
                    .preempted_by
                    .map_or(candidate, |existing| existing.min(candidate));
                debug!(candidate, holder, "recording preempting bid");
                state.preempted_by = Some(bid);
            }
            return Ok(None);
        }

        if state
            .reservation
            .as_ref()
            .is_some_and(|reservation| candidate > reservation.candidate)
        {
            return Ok(None);
        }

        state.last_sequence += 1;
        let token = FencingToken::new(candidate, state.last_sequence);
        state.held = Some(Held {
            token,
            expires_at_ms: self.clock.now_ms().saturating_add(self.ttl_ms()),
        });
        state.preempted_by = None;
        state.reservation = None;

        debug!(%token, "lease granted");

        Ok(Some(Lease {
            token,
            ttl: self.ttl,
        }))
    }

    async fn renew(&self, token: &FencingToken) -> Result<bool, Self::Error> {
        let mut state = self.lock_for_client().await?;

        if state.preempted_by.is_some() {
            return Ok(false);
        }

        let expires_at_ms = self.clock.now_ms().saturating_add(self.ttl_ms());
        match state.held.as_mut() {
            Some(held) if held.token == *token => {
                held.expires_at_ms = expires_at_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, token: &FencingToken) -> Result<(), Self::Error> {
        let mut state = self.lock_for_client().await?;

        if state.held.as_ref().is_some_and(|held| held.token == *token) {
            state.held = None;
            // a released lease goes straight to a waiting lower index bidder
            if let Some(candidate) = state.preempted_by.take() {
                state.reservation = Some(Reservation {
                    candidate,
                    until_ms: self.clock.now_ms().saturating_add(self.ttl_ms()),
                });
            }
            debug!(%token, "lease released");
        }

        Ok(())
    }

    async fn holder(&self) -> Result<Option<FencingToken>, Self::Error> {
        let state = self.lock_for_client().await?;

        Ok(state.held.as_ref().map(|held| held.token))
    }
}
