//! A bounded set of interchangeable connections for one pool key.
//!
//! Idle connections live in two stacks. Returned connections go onto
//! `idle_new`; every pruning pass retires what is still on `idle_old` (down to
//! the minimum size) and then moves `idle_new` over, so a connection is
//! closed once it has sat unused for a full pruning period.
//!
//! Checkout order is `idle_new` first, then `idle_old`, then a fresh
//! connection when `total < max_pool_size`, then a wait for a return.
//! Blocking callers wait on a condvar; async opens wait on a [`Notify`] from
//! their own task and only move to the blocking pool to connect.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::error::{InternalError, PoolError, PoolResult};
use crate::internal::{InternalConnection, OwnerLease};
use crate::options::{ConnectionOptions, PoolGroupOptions, PoolKey};
use crate::provider::ConnectionProvider;
use crate::retry::{Completion, RetryToken};

/// Outcome of a pool checkout.
#[derive(Debug)]
pub(crate) enum Checkout {
    /// A connection owned by the caller's lease.
    Ready(InternalConnection),
    /// The retry token will deliver the result.
    Pending,
    /// Nothing became available, or the pool is shut down.
    Exhausted,
}

/// Point-in-time statistics for a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections owned by the pool, idle or checked out.
    pub total: usize,
    /// Idle connections.
    pub idle: usize,
    /// Connections currently handed out.
    pub active: usize,
    /// Physical connections created.
    pub created: u64,
    /// Checkouts served from the idle stacks.
    pub reused: u64,
    /// Physical connections closed.
    pub disposed: u64,
    /// Checkouts that gave up waiting.
    pub timeouts: u64,
    /// Whether the pool still hands out connections.
    pub running: bool,
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    disposed: AtomicU64,
    timeouts: AtomicU64,
}

/// What a checkout found under the lock.
enum Slot {
    Idle(InternalConnection),
    /// `total` was bumped for a connection the caller must create.
    Reserved,
    Full,
    Closed,
}

#[derive(Debug)]
struct PoolState {
    idle_new: Vec<InternalConnection>,
    idle_old: Vec<InternalConnection>,
    total: usize,
    running: bool,
}

impl PoolState {
    fn pop_idle(&mut self) -> Option<InternalConnection> {
        self.idle_new.pop().or_else(|| self.idle_old.pop())
    }

    fn idle(&self) -> usize {
        self.idle_new.len() + self.idle_old.len()
    }

    fn release_slots(&mut self, n: usize) {
        self.total = self.total.saturating_sub(n);
    }

    fn take_slot(&mut self, max_pool_size: usize) -> Slot {
        if !self.running {
            return Slot::Closed;
        }
        if let Some(conn) = self.pop_idle() {
            return Slot::Idle(conn);
        }
        if self.total < max_pool_size {
            self.total += 1;
            return Slot::Reserved;
        }
        Slot::Full
    }
}

/// A connection pool bound to one [`PoolKey`].
pub struct Pool {
    key: PoolKey,
    options: Arc<ConnectionOptions>,
    group_options: PoolGroupOptions,
    provider: Arc<dyn ConnectionProvider>,
    connection_ids: Arc<AtomicU64>,
    state: Mutex<PoolState>,
    returned: Condvar,
    available: Notify,
    waiting: AtomicUsize,
    counters: PoolCounters,
    this: Weak<Pool>,
}

impl Pool {
    pub(crate) fn new(
        key: PoolKey,
        options: Arc<ConnectionOptions>,
        provider: Arc<dyn ConnectionProvider>,
        connection_ids: Arc<AtomicU64>,
    ) -> Arc<Self> {
        let group_options = options.pool_options().clone();
        info!(
            pool = %key,
            min_pool_size = group_options.min_pool_size,
            max_pool_size = group_options.max_pool_size,
            "connection pool created"
        );
        Arc::new_cyclic(|this| Self {
            key,
            options,
            group_options,
            provider,
            connection_ids,
            state: Mutex::new(PoolState {
                idle_new: Vec::new(),
                idle_old: Vec::new(),
                total: 0,
                running: true,
            }),
            returned: Condvar::new(),
            available: Notify::new(),
            waiting: AtomicUsize::new(0),
            counters: PoolCounters::default(),
            this: this.clone(),
        })
    }

    /// The key this pool serves.
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Group options in effect for this pool.
    pub fn options(&self) -> &PoolGroupOptions {
        &self.group_options
    }

    /// Connections currently owned by the pool.
    pub fn count(&self) -> usize {
        self.state.lock().total
    }

    /// Whether the pool still hands out connections.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Callers waiting for a return.
    pub fn waiters(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    /// Snapshot of the pool's counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let idle = state.idle();
        PoolStats {
            total: state.total,
            idle,
            active: state.total.saturating_sub(idle),
            created: self.counters.created.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            disposed: self.counters.disposed.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            running: state.running,
        }
    }

    fn creation_timeout(&self) -> Duration {
        self.group_options.creation_timeout
    }

    fn load_balance_timeout(&self) -> Option<Duration> {
        self.group_options
            .use_load_balancing()
            .then_some(self.group_options.load_balance_timeout)
    }

    pub(crate) fn creation_timeout_ms(&self) -> u64 {
        u64::try_from(self.creation_timeout().as_millis()).unwrap_or(u64::MAX)
    }

    /// Check out a connection for `lease`.
    ///
    /// Without a retry token the call blocks up to the creation timeout.
    /// With one, only idle connections are served inline; anything slower
    /// moves to a task that completes the token, and the call returns
    /// [`Checkout::Pending`].
    pub(crate) fn try_get_connection(
        &self,
        lease: &OwnerLease,
        retry: &mut Option<RetryToken>,
    ) -> PoolResult<Checkout> {
        if retry.is_none() {
            return Ok(match self.get_connection(lease, self.creation_timeout())? {
                Some(conn) => Checkout::Ready(conn),
                None => Checkout::Exhausted,
            });
        }

        let idle = {
            let mut state = self.state.lock();
            if !state.running {
                return Ok(Checkout::Exhausted);
            }
            state.pop_idle()
        };
        if let Some(conn) = idle {
            return self.reuse(conn, lease).map(Checkout::Ready);
        }

        let (Some(token), Some(pool)) = (retry.take(), self.this.upgrade()) else {
            return Ok(Checkout::Exhausted);
        };
        tokio::spawn(pool.wait_for_pending_open(lease.clone(), token));
        Ok(Checkout::Pending)
    }

    /// Blocking checkout. `None` means the wait timed out or the pool is no
    /// longer running.
    pub(crate) fn get_connection(
        &self,
        lease: &OwnerLease,
        timeout: Duration,
    ) -> PoolResult<Option<InternalConnection>> {
        // Too far out to represent means no deadline.
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        let mut timed_out = false;
        loop {
            match state.take_slot(self.group_options.max_pool_size) {
                Slot::Closed => return Ok(None),
                Slot::Idle(conn) => {
                    drop(state);
                    return self.reuse(conn, lease).map(Some);
                }
                Slot::Reserved => {
                    drop(state);
                    return self.create_in_reserved_slot(lease).map(Some);
                }
                Slot::Full => {}
            }
            if timed_out {
                self.record_timeout(timeout);
                return Ok(None);
            }
            self.waiting.fetch_add(1, Ordering::Relaxed);
            timed_out = match deadline {
                Some(deadline) => self.returned.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.returned.wait(&mut state);
                    false
                }
            };
            self.waiting.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Runs as its own task on behalf of an async open, so a result produced
    /// after the caller left still finds its way back to the pool.
    async fn wait_for_pending_open(self: Arc<Self>, lease: OwnerLease, mut token: RetryToken) {
        let outcome = self.get_connection_async(&lease, &mut token).await;
        let completion = match outcome {
            Ok(Some(conn)) => Completion::Ready(conn),
            Ok(None) if token.is_abandoned() => {
                trace!(pool = %self.key, "pending open abandoned while waiting");
                return;
            }
            Ok(None) if self.is_running() => {
                Completion::Failed(PoolError::pooled_open_timeout(self.creation_timeout_ms()))
            }
            Ok(None) => match token.backoff().step() {
                Some((delay, next)) => {
                    tokio::time::sleep(delay).await;
                    Completion::Retry(next)
                }
                None => {
                    Completion::Failed(PoolError::pooled_open_timeout(self.creation_timeout_ms()))
                }
            },
            Err(e) => Completion::Failed(e),
        };
        if let Err(Completion::Ready(conn)) = token.complete(completion) {
            debug!(
                pool = %self.key,
                connection_id = conn.id(),
                emancipated = conn.is_emancipated(),
                "caller gone, returning connection"
            );
            if let Err(e) = self.put_object(conn, &lease) {
                warn!(pool = %self.key, error = %e, "failed to return abandoned connection");
            }
        }
    }

    /// Async checkout. `None` means the wait timed out, the pool is no
    /// longer running, or the caller stopped listening.
    async fn get_connection_async(
        self: &Arc<Self>,
        lease: &OwnerLease,
        token: &mut RetryToken,
    ) -> PoolResult<Option<InternalConnection>> {
        let timeout = self.creation_timeout();
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        let mut timed_out = false;
        loop {
            // Registered before looking, so a return in between still wakes us.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let slot = self.state.lock().take_slot(self.group_options.max_pool_size);
            match slot {
                Slot::Closed => return Ok(None),
                Slot::Idle(conn) => return self.reuse(conn, lease).map(Some),
                Slot::Reserved => return self.create_in_reserved_slot_async(lease).await.map(Some),
                Slot::Full => {}
            }
            if timed_out {
                self.record_timeout(timeout);
                return Ok(None);
            }

            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let mut abandoned = false;
            self.waiting.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                () = notified => {}
                () = expired => timed_out = true,
                () = token.abandoned() => abandoned = true,
            }
            self.waiting.fetch_sub(1, Ordering::Relaxed);
            if abandoned {
                return Ok(None);
            }
        }
    }

    /// Replace a checked-out connection with a new one in the same slot.
    ///
    /// `None` means the pool shut down; the old connection is disposed
    /// either way.
    pub(crate) fn replace_connection(
        &self,
        lease: &OwnerLease,
        old: InternalConnection,
    ) -> PoolResult<Option<InternalConnection>> {
        debug!(pool = %self.key, connection_id = old.id(), "replacing connection");
        self.dispose(old);
        if !self.is_running() {
            self.release_slot();
            return Ok(None);
        }
        self.create_in_reserved_slot(lease).map(Some)
    }

    /// Return a connection from its owner.
    ///
    /// The connection is reset and either pushed onto `idle_new` or
    /// disposed. Bookkeeping errors dispose the connection and propagate.
    pub(crate) fn put_object(&self, mut conn: InternalConnection, lease: &OwnerLease) -> PoolResult<()> {
        conn.deactivate(self.load_balance_timeout());
        if let Err(e) = conn.pre_push(Some(lease)) {
            self.dispose(conn);
            self.release_slot();
            return Err(e);
        }

        let rejected = {
            let mut state = self.state.lock();
            if state.running && conn.can_be_pooled() {
                trace!(pool = %self.key, connection_id = conn.id(), "connection returned to pool");
                state.idle_new.push(conn);
                None
            } else {
                state.release_slots(1);
                Some(conn)
            }
        };
        if let Some(conn) = rejected {
            debug!(pool = %self.key, connection_id = conn.id(), "connection not reusable, disposing");
            self.dispose(conn);
        }
        self.wake_one();
        Ok(())
    }

    /// One pruning pass. Returns `true` when the pool owns no connections.
    pub(crate) fn prune(&self) -> bool {
        let lifetime = self.load_balance_timeout();
        let min = self.group_options.min_pool_size;
        let (expired, deficit) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut expired = Vec::new();

            if !state.running {
                expired.append(&mut state.idle_new);
                expired.append(&mut state.idle_old);
            } else {
                for stack in [&mut state.idle_new, &mut state.idle_old] {
                    let (stale, fresh): (Vec<_>, Vec<_>) =
                        stack.drain(..).partition(|c| c.is_stale(lifetime));
                    *stack = fresh;
                    expired.extend(stale);
                }
                let mut total = state.total.saturating_sub(expired.len());
                while total > min {
                    match state.idle_old.pop() {
                        Some(conn) => {
                            expired.push(conn);
                            total -= 1;
                        }
                        None => break,
                    }
                }
                let aged = std::mem::take(&mut state.idle_new);
                state.idle_old.extend(aged);
            }

            state.release_slots(expired.len());
            let deficit = if state.running {
                min.saturating_sub(state.total)
            } else {
                0
            };
            state.total += deficit;
            (expired, deficit)
        };

        if !expired.is_empty() {
            debug!(pool = %self.key, disposed = expired.len(), "pruned idle connections");
        }
        for conn in expired {
            self.dispose(conn);
        }
        if deficit > 0 {
            self.fill_to_minimum(deficit);
        }
        self.count() == 0
    }

    /// Create `n` idle connections in slots already reserved.
    fn fill_to_minimum(&self, n: usize) {
        for created in 0..n {
            let conn = match self.create_object() {
                Ok(mut conn) => match conn.pre_push(None) {
                    Ok(()) => conn,
                    Err(e) => {
                        warn!(pool = %self.key, error = %e, "new connection rejected");
                        self.dispose(conn);
                        self.release_slot();
                        continue;
                    }
                },
                Err(e) => {
                    warn!(pool = %self.key, error = %e, "failed to top up pool to its minimum size");
                    let mut state = self.state.lock();
                    state.release_slots(n - created);
                    drop(state);
                    self.wake_all();
                    return;
                }
            };
            let rejected = {
                let mut state = self.state.lock();
                if state.running {
                    state.idle_new.push(conn);
                    None
                } else {
                    state.release_slots(1);
                    Some(conn)
                }
            };
            match rejected {
                Some(conn) => self.dispose(conn),
                None => self.wake_one(),
            }
        }
    }

    /// Stop handing out connections and close everything idle. Checked-out
    /// connections are disposed as they come back.
    pub(crate) fn shutdown(&self) {
        let drained = {
            let mut state = self.state.lock();
            if !state.running && state.idle() == 0 {
                return;
            }
            state.running = false;
            let mut drained = std::mem::take(&mut state.idle_new);
            drained.append(&mut state.idle_old);
            state.release_slots(drained.len());
            drained
        };
        info!(pool = %self.key, disposed = drained.len(), "connection pool shut down");
        self.wake_all();
        for conn in drained {
            self.dispose(conn);
        }
    }

    fn create_object(&self) -> PoolResult<InternalConnection> {
        let physical = self
            .provider
            .connect(&self.options, &self.key)
            .map_err(PoolError::Connect)?;
        let id = self.connection_ids.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(pool = %self.key, connection_id = id, "physical connection opened");
        Ok(InternalConnection::new(
            id,
            self.key.clone(),
            physical,
            Some(self.this.clone()),
        ))
    }

    /// Connect on the blocking pool; the waiting itself never occupies a
    /// blocking thread.
    async fn create_in_reserved_slot_async(self: &Arc<Self>, lease: &OwnerLease) -> PoolResult<InternalConnection> {
        let pool = Arc::clone(self);
        let lease = lease.clone();
        match tokio::task::spawn_blocking(move || pool.create_in_reserved_slot(&lease)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(pool = %self.key, error = %e, "connection creation task failed");
                self.release_slot();
                Err(PoolError::internal(InternalError::CreationTaskLost))
            }
        }
    }

    fn create_in_reserved_slot(&self, lease: &OwnerLease) -> PoolResult<InternalConnection> {
        let mut conn = match self.create_object() {
            Ok(conn) => conn,
            Err(e) => {
                self.release_slot();
                return Err(e);
            }
        };
        if let Err(e) = conn.pre_push(None) {
            self.dispose(conn);
            self.release_slot();
            return Err(e);
        }
        self.prepare(conn, lease)
    }

    fn reuse(&self, conn: InternalConnection, lease: &OwnerLease) -> PoolResult<InternalConnection> {
        self.counters.reused.fetch_add(1, Ordering::Relaxed);
        self.prepare(conn, lease)
    }

    fn record_timeout(&self, timeout: Duration) {
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        debug!(pool = %self.key, timeout_ms = timeout.as_millis() as u64, "pool exhausted");
    }

    fn prepare(&self, mut conn: InternalConnection, lease: &OwnerLease) -> PoolResult<InternalConnection> {
        if let Err(e) = conn.post_pop(lease.clone()) {
            warn!(pool = %self.key, connection_id = conn.id(), error = %e, "connection bookkeeping violated");
            self.dispose(conn);
            self.release_slot();
            return Err(e);
        }
        conn.activate();
        Ok(conn)
    }

    fn dispose(&self, mut conn: InternalConnection) {
        conn.dispose();
        self.counters.disposed.fetch_add(1, Ordering::Relaxed);
    }

    fn release_slot(&self) {
        self.state.lock().release_slots(1);
        self.wake_one();
    }

    fn wake_one(&self) {
        self.returned.notify_one();
        self.available.notify_one();
    }

    fn wake_all(&self) {
        self.returned.notify_all();
        self.available.notify_waiters();
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("key", &self.key.to_string())
            .field("stats", &self.stats())
            .finish()
    }
}
