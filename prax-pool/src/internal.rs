//! The internal connection: one physical session plus the bookkeeping that
//! moves it between owners and pools.
//!
//! `pooled_count` tracks where a connection lives:
//!
//! | value | pooled connection | non-pooled connection |
//! |-------|-------------------|-----------------------|
//! | `1`   | idle in the pool  | never |
//! | `0`   | checked out       | created, not yet handed out |
//! | `-1`  | never             | handed out |
//!
//! Every push and pop checks these values, so a connection can never sit in a
//! pool twice or have two owners at once.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{InternalError, PoolResult};
use crate::options::PoolKey;
use crate::pool::Pool;
use crate::provider::PhysicalConnection;

/// Proof that a particular owner, during a particular open, holds a
/// connection.
///
/// The owner bumps its epoch every time it closes or is dropped, which makes
/// every lease issued before that point unreachable.
#[derive(Debug, Clone)]
pub(crate) struct OwnerLease {
    owner_id: u64,
    epoch: Arc<AtomicU64>,
    generation: u64,
}

impl OwnerLease {
    pub(crate) fn new(owner_id: u64, epoch: Arc<AtomicU64>) -> Self {
        let generation = epoch.load(Ordering::Acquire);
        Self {
            owner_id,
            epoch,
            generation,
        }
    }

    /// Whether the owner is still inside the open this lease was issued for.
    pub(crate) fn is_live(&self) -> bool {
        self.epoch.load(Ordering::Acquire) == self.generation
    }

    fn same_as(&self, other: &OwnerLease) -> bool {
        self.owner_id == other.owner_id && self.generation == other.generation
    }
}

/// A physical connection tracked by the pooling engine.
pub struct InternalConnection {
    id: u64,
    key: PoolKey,
    physical: Box<dyn PhysicalConnection>,
    pool: Option<Weak<Pool>>,
    pooled_count: i8,
    doomed: bool,
    cannot_be_pooled: bool,
    disposed: bool,
    created_at: Instant,
    activated_at: Option<Instant>,
    lease: Option<OwnerLease>,
}

impl InternalConnection {
    pub(crate) fn new(
        id: u64,
        key: PoolKey,
        physical: Box<dyn PhysicalConnection>,
        pool: Option<Weak<Pool>>,
    ) -> Self {
        Self {
            id,
            key,
            physical,
            pool,
            pooled_count: 0,
            doomed: false,
            cannot_be_pooled: false,
            disposed: false,
            created_at: Instant::now(),
            activated_at: None,
            lease: None,
        }
    }

    /// Unique id of this connection within its factory.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Key of the pool group this connection was opened for.
    pub fn pool_key(&self) -> &PoolKey {
        &self.key
    }

    /// When the physical connection was established.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time since the physical connection was established.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// When the connection was last handed to an owner.
    pub fn activated_at(&self) -> Option<Instant> {
        self.activated_at
    }

    /// Whether this connection belongs to a pool.
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// Whether this connection will be disposed instead of reused.
    pub fn is_doomed(&self) -> bool {
        self.doomed
    }

    /// Mark the connection as never to be reused.
    pub fn doom(&mut self) {
        if !self.doomed {
            debug!(connection_id = self.id, "connection doomed");
        }
        self.doomed = true;
    }

    /// Keep this connection out of the pool without dooming the session.
    pub fn set_cannot_be_pooled(&mut self) {
        self.cannot_be_pooled = true;
    }

    /// Access the driver session.
    pub fn physical(&mut self) -> &mut dyn PhysicalConnection {
        self.physical.as_mut()
    }

    /// `1` while idle in a pool, `0` while checked out from one, `-1` while
    /// a non-pooled connection is in use.
    pub fn pooled_count(&self) -> i8 {
        self.pooled_count
    }

    pub(crate) fn pool(&self) -> Option<Arc<Pool>> {
        self.pool.as_ref().and_then(Weak::upgrade)
    }

    fn owner_is_reachable(&self) -> bool {
        self.lease.as_ref().is_some_and(OwnerLease::is_live)
    }

    /// No owner holds the connection and nothing marked it unusable.
    pub(crate) fn can_be_pooled(&self) -> bool {
        !self.doomed && !self.cannot_be_pooled && !self.owner_is_reachable()
    }

    /// Checked out, but its owner is gone.
    pub(crate) fn is_emancipated(&self) -> bool {
        self.pooled_count < 1 && !self.owner_is_reachable()
    }

    /// Bookkeeping before the connection enters a pool's idle stacks.
    ///
    /// `expected` is the owner returning it, or `None` for a freshly created
    /// connection.
    pub(crate) fn pre_push(&mut self, expected: Option<&OwnerLease>) -> PoolResult<()> {
        match (expected, &self.lease) {
            (None, Some(current)) if current.is_live() => {
                return Err(InternalError::UnpooledObjectHasWrongOwner.into());
            }
            (Some(expected), Some(current)) if !current.same_as(expected) => {
                return Err(InternalError::UnpooledObjectHasWrongOwner.into());
            }
            (Some(_), None) => return Err(InternalError::UnpooledObjectHasWrongOwner.into()),
            _ => {}
        }
        if self.pooled_count != 0 {
            return Err(InternalError::PushingObjectSecondTime.into());
        }
        self.pooled_count += 1;
        self.lease = None;
        Ok(())
    }

    /// Bookkeeping when the connection is handed to `owner`.
    pub(crate) fn post_pop(&mut self, owner: OwnerLease) -> PoolResult<()> {
        if self.owner_is_reachable() {
            return Err(InternalError::PooledObjectHasOwner.into());
        }
        self.lease = Some(owner);
        self.pooled_count -= 1;
        if self.pool.is_some() {
            if self.pooled_count != 0 {
                return Err(InternalError::PooledObjectInPoolMoreThanOnce.into());
            }
        } else if self.pooled_count != -1 {
            return Err(InternalError::NonPooledObjectUsedMoreThanOnce.into());
        }
        Ok(())
    }

    /// Called on hand-out.
    pub(crate) fn activate(&mut self) {
        self.activated_at = Some(Instant::now());
        trace!(connection_id = self.id, "connection activated");
    }

    /// Called on return: reset the session and decide whether it may be
    /// reused. Failures doom the connection rather than propagate.
    pub(crate) fn deactivate(&mut self, load_balance_timeout: Option<Duration>) {
        if self.physical.is_broken() {
            self.doom();
        } else if let Err(e) = self.physical.reset() {
            warn!(connection_id = self.id, error = %e, "connection reset failed");
            self.doom();
        }
        if let Some(lifetime) = load_balance_timeout {
            if self.age() > lifetime {
                debug!(connection_id = self.id, "connection exceeded load balance timeout");
                self.doom();
            }
        }
        trace!(connection_id = self.id, doomed = self.doomed, "connection deactivated");
    }

    /// Whether an idle connection should be retired.
    pub(crate) fn is_stale(&self, load_balance_timeout: Option<Duration>) -> bool {
        self.doomed
            || self.physical.is_broken()
            || load_balance_timeout.is_some_and(|lifetime| self.age() > lifetime)
    }

    /// Drop the owner reference when a non-pooled connection is closed.
    pub(crate) fn release_owner(&mut self) {
        self.lease = None;
    }

    /// Close the physical session. Idempotent.
    pub(crate) fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.doomed = true;
        self.physical.close();
        trace!(connection_id = self.id, "connection disposed");
    }
}

impl Drop for InternalConnection {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for InternalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalConnection")
            .field("id", &self.id)
            .field("pooled", &self.is_pooled())
            .field("pooled_count", &self.pooled_count)
            .field("doomed", &self.doomed)
            .finish_non_exhaustive()
    }
}
