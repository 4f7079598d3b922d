//! The connection factory: entry point for opening, closing and
//! administering pooled connections.
//!
//! The factory owns the table of pool groups. Lookups read a published
//! snapshot without locking; inserts and pruning build a new table and
//! publish it, so readers never see a table mid-mutation.
//!
//! ```rust,no_run
//! use prax_pool::{BoxError, ConnectionFactory, ConnectionOptions, ConnectionProvider, PhysicalConnection, PoolKey};
//!
//! struct Session;
//! impl PhysicalConnection for Session {}
//!
//! struct Driver;
//! impl ConnectionProvider for Driver {
//!     fn connect(&self, _: &ConnectionOptions, _: &PoolKey) -> Result<Box<dyn PhysicalConnection>, BoxError> {
//!         Ok(Box::new(Session))
//!     }
//! }
//!
//! # async fn run() -> Result<(), prax_pool::PoolError> {
//! let factory = ConnectionFactory::new(Driver);
//! factory.start_pruning();
//!
//! let conn = factory.connection("postgres://app@db.internal/orders?max_pool_size=20")?;
//! conn.open_async().await?;
//! conn.close()?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::FactoryConfig;
use crate::error::{InternalError, PoolError, PoolResult};
use crate::group::PoolGroup;
use crate::handle::DbConnection;
use crate::internal::{InternalConnection, OwnerLease};
use crate::options::{ConnectionOptions, Identity, PoolKey};
use crate::pool::{Checkout, Pool, PoolStats};
use crate::provider::ConnectionProvider;
use crate::retry::{Backoff, Completion, RetryToken};
use crate::throttle::NonPooledThrottle;

type GroupTable = HashMap<PoolKey, Arc<PoolGroup>>;

/// Everything needed to open a connection on behalf of one owner.
#[derive(Debug, Clone)]
pub(crate) struct OpenRequest {
    pub(crate) lease: OwnerLease,
    pub(crate) key: PoolKey,
    pub(crate) options: Arc<ConnectionOptions>,
}

/// Creates, pools and retires connections for every connection string in
/// the process.
pub struct ConnectionFactory {
    provider: Arc<dyn ConnectionProvider>,
    config: FactoryConfig,
    groups: ArcSwap<GroupTable>,
    groups_write: Mutex<()>,
    pools_to_release: Mutex<Vec<Arc<Pool>>>,
    groups_to_release: Mutex<Vec<Arc<PoolGroup>>>,
    throttle: Arc<NonPooledThrottle>,
    connection_ids: Arc<AtomicU64>,
    owner_ids: AtomicU64,
    pruning: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionFactory {
    /// Create a factory with the default configuration.
    pub fn new(provider: impl ConnectionProvider) -> Arc<Self> {
        Self::build(Arc::new(provider), FactoryConfig::default())
    }

    /// Create a factory with a custom configuration.
    pub fn with_config(provider: impl ConnectionProvider, config: FactoryConfig) -> PoolResult<Arc<Self>> {
        config.validate()?;
        Ok(Self::build(Arc::new(provider), config))
    }

    fn build(provider: Arc<dyn ConnectionProvider>, config: FactoryConfig) -> Arc<Self> {
        info!(
            throttle_slots = config.throttle_slots,
            max_open_retries = config.max_open_retries,
            "connection factory created"
        );
        Arc::new(Self {
            throttle: Arc::new(NonPooledThrottle::new(config.throttle_slots)),
            provider,
            config,
            groups: ArcSwap::from_pointee(GroupTable::new()),
            groups_write: Mutex::new(()),
            pools_to_release: Mutex::new(Vec::new()),
            groups_to_release: Mutex::new(Vec::new()),
            connection_ids: Arc::new(AtomicU64::new(0)),
            owner_ids: AtomicU64::new(0),
            pruning: Mutex::new(None),
        })
    }

    /// The factory configuration.
    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// Create a closed handle for a connection string.
    pub fn connection(self: &Arc<Self>, connection_string: &str) -> PoolResult<DbConnection> {
        self.connection_for(connection_string, None)
    }

    /// Create a closed handle that pools by `identity` when the options ask
    /// for it.
    pub fn connection_as(
        self: &Arc<Self>,
        connection_string: &str,
        identity: Identity,
    ) -> PoolResult<DbConnection> {
        self.connection_for(connection_string, Some(identity))
    }

    fn connection_for(
        self: &Arc<Self>,
        connection_string: &str,
        identity: Option<Identity>,
    ) -> PoolResult<DbConnection> {
        let options = Arc::new(ConnectionOptions::parse(connection_string)?);
        let key = PoolKey::new(&options, identity.as_ref());
        let owner_id = self.owner_ids.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(DbConnection::new(Arc::clone(self), owner_id, key, options))
    }

    /// Number of live pool groups.
    pub fn pool_group_count(&self) -> usize {
        self.groups.load().len()
    }

    /// The live group for `key`, if any.
    pub fn pool_group(&self, key: &PoolKey) -> Option<Arc<PoolGroup>> {
        self.groups.load().get(key).cloned()
    }

    /// Statistics of the pool serving `connection_string`, if one exists.
    pub fn pool_stats(&self, connection_string: &str) -> PoolResult<Option<PoolStats>> {
        self.pool_stats_for(connection_string, None)
    }

    /// Statistics of the pool serving `connection_string` for `identity`.
    pub fn pool_stats_as(&self, connection_string: &str, identity: &Identity) -> PoolResult<Option<PoolStats>> {
        self.pool_stats_for(connection_string, Some(identity))
    }

    fn pool_stats_for(&self, connection_string: &str, identity: Option<&Identity>) -> PoolResult<Option<PoolStats>> {
        let options = ConnectionOptions::parse(connection_string)?;
        let key = PoolKey::new(&options, identity);
        Ok(self
            .pool_group(&key)
            .and_then(|group| group.pool())
            .map(|pool| pool.stats()))
    }

    /// Pools shut down but still waiting for connections to come back.
    pub fn pools_awaiting_release(&self) -> usize {
        self.pools_to_release.lock().len()
    }

    /// Groups removed from the live table but not yet released.
    pub fn groups_awaiting_release(&self) -> usize {
        self.groups_to_release.lock().len()
    }

    /// Resolve the live group for `key`, replacing a disabled one.
    fn get_pool_group(&self, key: &PoolKey, options: &Arc<ConnectionOptions>) -> Arc<PoolGroup> {
        if let Some(group) = self.groups.load().get(key) {
            if !group.is_disabled() {
                return Arc::clone(group);
            }
        }

        let _write = self.groups_write.lock();
        let current = self.groups.load_full();
        if let Some(group) = current.get(key) {
            if !group.is_disabled() {
                return Arc::clone(group);
            }
        }

        let group = Arc::new(PoolGroup::new(key.clone(), Arc::clone(options)));
        let mut next = GroupTable::clone(&current);
        if let Some(replaced) = next.insert(key.clone(), Arc::clone(&group)) {
            debug!(pool = %key, "replacing disabled pool group");
            self.groups_to_release.lock().push(replaced);
        }
        self.groups.store(Arc::new(next));
        group
    }

    /// Obtain a connection for the request.
    ///
    /// `Ok(Some(_))` is a connection ready now. `Ok(None)` means the result
    /// will be delivered through `retry`; it is only returned when a token
    /// was supplied. `old_connection` is swapped for a new connection in the
    /// slot it holds in its own pool; when that pool has shut down, the open
    /// proceeds like any other.
    pub(crate) fn try_get_connection(
        &self,
        request: &OpenRequest,
        mut retry: Option<RetryToken>,
        old_connection: Option<InternalConnection>,
    ) -> PoolResult<Option<InternalConnection>> {
        if let Err(e) = self.provider.demand_permission(&request.options) {
            if let Some(mut old) = old_connection {
                old.doom();
                self.close_connection(old, &request.lease);
            }
            return Err(e);
        }

        if let Some(old) = old_connection {
            match old.pool() {
                Some(pool) => {
                    if let Some(conn) = pool.replace_connection(&request.lease, old)? {
                        return Ok(Some(conn));
                    }
                }
                None => {
                    trace!(connection_id = old.id(), "disposing replaced non-pooled connection");
                    drop(old);
                }
            }
        }

        let mut backoff = match &retry {
            Some(token) => token.backoff(),
            None => Backoff::new(&self.config),
        };
        let mut timeout_ms = request.options.pool_options().creation_timeout.as_millis() as u64;

        loop {
            let group = self.get_pool_group(&request.key, &request.options);
            let Some(pool) = group.get_pool(&self.provider, &self.connection_ids) else {
                if group.is_disabled() {
                    // Cleared between lookup and use; the next lookup rebuilds it.
                    match backoff.step() {
                        Some((_, next)) => {
                            backoff = next;
                            continue;
                        }
                        None => break,
                    }
                }
                return self.open_non_pooled(request, retry);
            };
            timeout_ms = pool.creation_timeout_ms();

            match pool.try_get_connection(&request.lease, &mut retry)? {
                Checkout::Ready(conn) => return Ok(Some(conn)),
                Checkout::Pending => return Ok(None),
                Checkout::Exhausted if pool.is_running() => {
                    return Err(PoolError::pooled_open_timeout(timeout_ms));
                }
                Checkout::Exhausted => {
                    let Some((delay, next)) = backoff.step() else {
                        break;
                    };
                    debug!(
                        pool = %request.key,
                        delay_ms = delay.as_millis() as u64,
                        "pool shut down during open, retrying"
                    );
                    match retry.take() {
                        Some(token) => {
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let _ = token.complete(Completion::Retry(next));
                            });
                            return Ok(None);
                        }
                        None => {
                            std::thread::sleep(delay);
                            backoff = next;
                        }
                    }
                }
            }
        }

        warn!(pool = %request.key, "open retries exhausted");
        Err(PoolError::pooled_open_timeout(timeout_ms))
    }

    fn open_non_pooled(
        &self,
        request: &OpenRequest,
        retry: Option<RetryToken>,
    ) -> PoolResult<Option<InternalConnection>> {
        let Some(token) = retry else {
            let conn = create_non_pooled(
                &self.provider,
                &self.connection_ids,
                &request.options,
                &request.key,
                &request.lease,
            )?;
            return Ok(Some(conn));
        };

        let throttle = Arc::clone(&self.throttle);
        let provider = Arc::clone(&self.provider);
        let ids = Arc::clone(&self.connection_ids);
        let request = request.clone();
        let timeout = request.options.connect_timeout;
        tokio::spawn(async move {
            let outcome = throttle
                .run(timeout, move || {
                    create_non_pooled(&provider, &ids, &request.options, &request.key, &request.lease)
                })
                .await;
            let completion = match outcome {
                Ok(conn) => Completion::Ready(conn),
                Err(e) => Completion::Failed(e),
            };
            if let Err(Completion::Ready(conn)) = token.complete(completion) {
                debug!(connection_id = conn.id(), "caller gone, disposing non-pooled connection");
            }
        });
        Ok(None)
    }

    /// Blocking open on behalf of an owner.
    pub(crate) fn open_connection(&self, request: &OpenRequest) -> PoolResult<InternalConnection> {
        self.try_get_connection(request, None, None)?
            .ok_or(PoolError::Internal(InternalError::CreationTaskLost))
    }

    /// Swap an owner's connection for a new one in the same pool slot.
    pub(crate) fn replace_connection(
        &self,
        request: &OpenRequest,
        old: InternalConnection,
    ) -> PoolResult<InternalConnection> {
        self.try_get_connection(request, None, Some(old))?
            .ok_or(PoolError::Internal(InternalError::CreationTaskLost))
    }

    /// Async open on behalf of an owner.
    ///
    /// If the future is dropped after the result was delivered but before it
    /// was read, the connection is taken back here.
    pub(crate) async fn open_connection_async(&self, request: &OpenRequest) -> PoolResult<InternalConnection> {
        let mut backoff = Backoff::new(&self.config);
        loop {
            let (token, rx) = RetryToken::new(backoff);
            let mut pending = PendingOpen {
                factory: self,
                lease: &request.lease,
                rx,
            };
            if let Some(conn) = self.try_get_connection(request, Some(token), None)? {
                return Ok(conn);
            }
            match (&mut pending.rx).await {
                Ok(Completion::Ready(conn)) => return Ok(conn),
                Ok(Completion::Failed(e)) => return Err(e),
                Ok(Completion::Retry(next)) => {
                    trace!(pool = %request.key, "retrying async open");
                    backoff = next;
                }
                Err(_) => return Err(PoolError::internal(InternalError::CreationTaskLost)),
            }
        }
    }

    /// Take a connection back from its owner. Never fails: pooling errors
    /// are logged and the connection is disposed.
    pub(crate) fn close_connection(&self, mut conn: InternalConnection, lease: &OwnerLease) {
        match conn.pool() {
            Some(pool) => {
                if let Err(e) = pool.put_object(conn, lease) {
                    warn!(error = %e, code = e.code(), "failed to return connection to its pool");
                }
            }
            None => {
                conn.deactivate(None);
                conn.release_owner();
                trace!(connection_id = conn.id(), "closing non-pooled connection");
                conn.dispose();
            }
        }
    }

    /// Force-clear the pool serving `connection_string`.
    pub fn clear_pool(&self, connection_string: &str) -> PoolResult<()> {
        let options = ConnectionOptions::parse(connection_string)?;
        self.clear_pool_key(&PoolKey::new(&options, None));
        Ok(())
    }

    /// Force-clear the pool serving `connection_string` for `identity`.
    pub fn clear_pool_as(&self, connection_string: &str, identity: &Identity) -> PoolResult<()> {
        let options = ConnectionOptions::parse(connection_string)?;
        self.clear_pool_key(&PoolKey::new(&options, Some(identity)));
        Ok(())
    }

    /// Force-clear the pool serving `key`.
    pub fn clear_pool_key(&self, key: &PoolKey) {
        if let Some(group) = self.pool_group(key) {
            self.clear_group(&group);
        }
    }

    /// Force-clear every pool.
    pub fn clear_all_pools(&self) {
        let groups = self.groups.load_full();
        info!(groups = groups.len(), "clearing all pools");
        for group in groups.values() {
            self.clear_group(group);
        }
    }

    fn clear_group(&self, group: &PoolGroup) {
        if let Some(pool) = group.clear() {
            self.queue_pool_for_release(pool);
        }
    }

    fn queue_pool_for_release(&self, pool: Arc<Pool>) {
        trace!(pool = %pool.key(), remaining = pool.count(), "pool queued for release");
        self.pools_to_release.lock().push(pool);
    }

    /// One pruning pass over the release queues and the live group table.
    pub fn prune_connection_pool_groups(&self) {
        {
            let mut pools = self.pools_to_release.lock();
            pools.retain(|pool| {
                let keep = pool.count() != 0;
                if !keep {
                    debug!(pool = %pool.key(), "released pool");
                }
                keep
            });
        }

        {
            let mut groups = self.groups_to_release.lock();
            groups.retain(|group| {
                let keep = group.pool().is_some_and(|pool| pool.count() != 0);
                if !keep {
                    debug!(pool = %group.key(), "released pool group");
                }
                keep
            });
        }

        let snapshot = self.groups.load_full();
        let mut prunable = Vec::new();
        for (key, group) in snapshot.iter() {
            let (idle, released) = group.prune();
            if let Some(pool) = released {
                self.queue_pool_for_release(pool);
            }
            if idle {
                prunable.push(key.clone());
            }
        }
        if prunable.is_empty() {
            return;
        }

        let _write = self.groups_write.lock();
        let current = self.groups.load_full();
        let mut survivors = GroupTable::with_capacity(current.len());
        let mut removed = Vec::new();
        for (key, group) in current.iter() {
            // A group swapped in after the scan is not the one found idle.
            let was_pruned = prunable.contains(key)
                && snapshot.get(key).is_some_and(|seen| Arc::ptr_eq(seen, group));
            if was_pruned {
                removed.push(Arc::clone(group));
            } else {
                survivors.insert(key.clone(), Arc::clone(group));
            }
        }
        self.groups.store(Arc::new(survivors));
        debug!(removed = removed.len(), "pruned idle pool groups");
        self.groups_to_release.lock().extend(removed);
    }

    /// Start the background pruning timer on the current tokio runtime.
    ///
    /// Returns `false` when called outside a runtime or when the timer is
    /// already running.
    pub fn start_pruning(self: &Arc<Self>) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime, pool pruning disabled");
            return false;
        };
        let mut pruning = self.pruning.lock();
        if pruning.as_ref().is_some_and(|task| !task.is_finished()) {
            return false;
        }

        let factory: Weak<Self> = Arc::downgrade(self);
        let delay = self.config.prune_initial_delay;
        let period = self.config.prune_period;
        *pruning = Some(runtime.spawn(prune_periodically(factory, delay, period)));
        debug!(
            initial_delay_ms = delay.as_millis() as u64,
            period_ms = period.as_millis() as u64,
            "pool pruning started"
        );
        true
    }

    /// Stop the background pruning timer.
    pub fn stop_pruning(&self) {
        if let Some(task) = self.pruning.lock().take() {
            task.abort();
            debug!("pool pruning stopped");
        }
    }
}

/// Receiving end of a deferred open.
struct PendingOpen<'a> {
    factory: &'a ConnectionFactory,
    lease: &'a OwnerLease,
    rx: oneshot::Receiver<Completion>,
}

impl Drop for PendingOpen<'_> {
    fn drop(&mut self) {
        // Anything sent after close() is handed back to its sender instead.
        self.rx.close();
        if let Ok(Completion::Ready(conn)) = self.rx.try_recv() {
            debug!(connection_id = conn.id(), "async open abandoned after delivery, taking connection back");
            self.factory.close_connection(conn, self.lease);
        }
    }
}

impl Drop for ConnectionFactory {
    fn drop(&mut self) {
        self.stop_pruning();
    }
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("config", &self.config)
            .field("pool_groups", &self.pool_group_count())
            .finish_non_exhaustive()
    }
}

async fn prune_periodically(factory: Weak<ConnectionFactory>, delay: Duration, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + delay, period);
    loop {
        ticker.tick().await;
        let Some(factory) = factory.upgrade() else {
            break;
        };
        // Topping pools up to their minimum size connects synchronously.
        let pass = tokio::task::spawn_blocking(move || factory.prune_connection_pool_groups());
        if let Err(e) = pass.await {
            warn!(error = %e, "pool pruning pass failed");
        }
    }
}

fn create_non_pooled(
    provider: &Arc<dyn ConnectionProvider>,
    connection_ids: &AtomicU64,
    options: &ConnectionOptions,
    key: &PoolKey,
    lease: &OwnerLease,
) -> PoolResult<InternalConnection> {
    let physical = provider.connect(options, key).map_err(PoolError::Connect)?;
    let id = connection_ids.fetch_add(1, Ordering::Relaxed) + 1;
    let mut conn = InternalConnection::new(id, key.clone(), physical, None);
    conn.post_pop(lease.clone())?;
    conn.activate();
    debug!(pool = %key, connection_id = id, "non-pooled connection opened");
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;
    use pretty_assertions::assert_eq;

    fn config() -> FactoryConfig {
        FactoryConfig::new().throttle_slots(2)
    }

    #[test]
    fn test_groups_shared_per_normalized_key() {
        let factory = ConnectionFactory::with_config(MockProvider::default(), config()).unwrap();
        let a = factory.connection("postgres://DB.internal/app?b=1&a=2").unwrap();
        let b = factory.connection("postgres://db.internal/app?a=2&b=1").unwrap();
        a.open().unwrap();
        b.open().unwrap();
        assert_eq!(factory.pool_group_count(), 1);
    }

    #[test]
    fn test_identity_splits_groups() {
        let factory = ConnectionFactory::with_config(MockProvider::default(), config()).unwrap();
        let url = "mssql://db/app?integrated_security=true";
        let alice = factory.connection_as(url, Identity::new("CORP\\alice")).unwrap();
        let bob = factory.connection_as(url, Identity::new("CORP\\bob")).unwrap();
        alice.open().unwrap();
        bob.open().unwrap();
        assert_eq!(factory.pool_group_count(), 2);
    }

    #[test]
    fn test_identity_pools_reachable_for_stats_and_clear() {
        let factory = ConnectionFactory::with_config(MockProvider::default(), config()).unwrap();
        let url = "mssql://db/app?integrated_security=true";
        let alice = Identity::new("CORP\\alice");
        let conn = factory.connection_as(url, alice.clone()).unwrap();
        conn.open().unwrap();

        let stats = factory.pool_stats_as(url, &alice).unwrap().unwrap();
        assert_eq!(stats.active, 1);
        assert!(factory.pool_stats_as(url, &Identity::new("CORP\\bob")).unwrap().is_none());

        factory.clear_pool_as(url, &alice).unwrap();
        assert!(factory.pool_group(conn.pool_key()).unwrap().is_disabled());
        assert_eq!(factory.pools_awaiting_release(), 1);
    }

    #[test]
    fn test_permission_hook_runs_before_open() {
        struct Locked;
        impl ConnectionProvider for Locked {
            fn connect(
                &self,
                _: &ConnectionOptions,
                _: &PoolKey,
            ) -> Result<Box<dyn crate::provider::PhysicalConnection>, crate::error::BoxError> {
                Err("unreachable".into())
            }
            fn demand_permission(&self, _: &ConnectionOptions) -> PoolResult<()> {
                Err(PoolError::PermissionDenied("outbound connections blocked".into()))
            }
        }

        let factory = ConnectionFactory::new(Locked);
        let conn = factory.connection("postgres://db/app").unwrap();
        let err = conn.open().unwrap_err();
        assert_eq!(err.code(), "P3004");
        assert_eq!(factory.pool_group_count(), 0);
    }

    #[test]
    fn test_disabled_group_replaced_on_lookup() {
        let factory = ConnectionFactory::with_config(MockProvider::default(), config()).unwrap();
        let url = "postgres://db/app";
        let conn = factory.connection(url).unwrap();
        conn.open().unwrap();
        conn.close().unwrap();

        let key = conn.pool_key().clone();
        let before = factory.pool_group(&key).unwrap();
        factory.clear_pool(url).unwrap();
        assert!(before.is_disabled());

        conn.open().unwrap();
        let after = factory.pool_group(&key).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(!after.is_disabled());
        assert_eq!(factory.groups_awaiting_release(), 1);
    }

    #[test]
    fn test_release_queues_drain_when_empty() {
        let factory = ConnectionFactory::with_config(MockProvider::default(), config()).unwrap();
        let conn = factory.connection("postgres://db/app").unwrap();
        conn.open().unwrap();

        factory.clear_all_pools();
        assert_eq!(factory.pools_awaiting_release(), 1);
        factory.prune_connection_pool_groups();
        assert_eq!(factory.pools_awaiting_release(), 1);

        conn.close().unwrap();
        factory.prune_connection_pool_groups();
        assert_eq!(factory.pools_awaiting_release(), 0);
    }

    #[tokio::test]
    async fn test_start_and_stop_pruning() {
        let factory = ConnectionFactory::with_config(MockProvider::default(), config()).unwrap();
        assert!(factory.start_pruning());
        assert!(!factory.start_pruning());
        factory.stop_pruning();
        assert!(factory.start_pruning());
    }

    #[test]
    fn test_start_pruning_outside_runtime() {
        let factory = ConnectionFactory::new(MockProvider::default());
        assert!(!factory.start_pruning());
    }
}
