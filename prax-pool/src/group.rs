//! Pool groups: the per-key holder of a pool and its policy.
//!
//! A group moves `Active -> Idle -> Disabled` across pruning passes in which
//! it owns no pool. Any use while `Idle` brings it back to `Active`. A
//! disabled group hands out nothing; the factory swaps in a fresh group on
//! the next lookup.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::options::{ConnectionOptions, PoolKey};
use crate::pool::Pool;
use crate::provider::ConnectionProvider;

/// Lifecycle state of a [`PoolGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// In use or holding a pool.
    Active,
    /// Saw one pruning pass without a pool.
    Idle,
    /// Cleared or pruned; never hands out a pool again.
    Disabled,
}

#[derive(Debug)]
struct GroupInner {
    pool: Option<Arc<Pool>>,
    state: GroupState,
}

/// Holds the pool for one [`PoolKey`].
#[derive(Debug)]
pub struct PoolGroup {
    key: PoolKey,
    options: Arc<ConnectionOptions>,
    inner: Mutex<GroupInner>,
}

impl PoolGroup {
    pub(crate) fn new(key: PoolKey, options: Arc<ConnectionOptions>) -> Self {
        debug!(pool = %key, pooling = options.pooling, "pool group created");
        Self {
            key,
            options,
            inner: Mutex::new(GroupInner {
                pool: None,
                state: GroupState::Active,
            }),
        }
    }

    /// The key this group serves.
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Options shared by every connection of the group.
    pub fn options(&self) -> &Arc<ConnectionOptions> {
        &self.options
    }

    /// Current lifecycle state.
    pub fn state(&self) -> GroupState {
        self.inner.lock().state
    }

    /// Whether the group was cleared or pruned away.
    pub fn is_disabled(&self) -> bool {
        self.state() == GroupState::Disabled
    }

    /// The current pool, without creating one.
    pub fn pool(&self) -> Option<Arc<Pool>> {
        self.inner.lock().pool.clone()
    }

    /// The group's pool, created on first use.
    ///
    /// `None` when pooling is off for these options or the group is disabled.
    pub(crate) fn get_pool(
        &self,
        provider: &Arc<dyn ConnectionProvider>,
        connection_ids: &Arc<AtomicU64>,
    ) -> Option<Arc<Pool>> {
        if !self.options.pooling {
            return None;
        }
        let mut inner = self.inner.lock();
        match inner.state {
            GroupState::Disabled => return None,
            GroupState::Idle => {
                debug!(pool = %self.key, "pool group reactivated");
                inner.state = GroupState::Active;
            }
            GroupState::Active => {}
        }
        let pool = inner.pool.get_or_insert_with(|| {
            Pool::new(
                self.key.clone(),
                self.options.clone(),
                provider.clone(),
                connection_ids.clone(),
            )
        });
        Some(pool.clone())
    }

    /// Disable the group and shut its pool down. The pool is returned so the
    /// caller can hold it until its checked-out connections come back.
    pub(crate) fn clear(&self) -> Option<Arc<Pool>> {
        let pool = {
            let mut inner = self.inner.lock();
            inner.state = GroupState::Disabled;
            inner.pool.take()
        };
        info!(pool = %self.key, "pool group cleared");
        if let Some(pool) = &pool {
            pool.shutdown();
        }
        pool
    }

    /// One pruning pass.
    ///
    /// Returns whether the group can be dropped, plus a pool that emptied
    /// out and was shut down during this pass.
    pub(crate) fn prune(&self) -> (bool, Option<Arc<Pool>>) {
        let current = self.inner.lock().pool.clone();

        let emptied = match current {
            Some(pool) if pool.prune() => Some(pool),
            _ => None,
        };

        let mut inner = self.inner.lock();
        let still_held = matches!(
            (&emptied, &inner.pool),
            (Some(pool), Some(held)) if Arc::ptr_eq(pool, held)
        );
        let released = if still_held { inner.pool.take() } else { None };

        let prunable = if inner.pool.is_some() {
            false
        } else {
            match inner.state {
                GroupState::Active => {
                    inner.state = GroupState::Idle;
                    false
                }
                GroupState::Idle => {
                    inner.state = GroupState::Disabled;
                    true
                }
                GroupState::Disabled => true,
            }
        };
        drop(inner);

        if let Some(pool) = &released {
            pool.shutdown();
            debug!(pool = %self.key, "empty pool released");
        }
        if prunable {
            debug!(pool = %self.key, "pool group disabled by pruning");
        }
        (prunable, released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;
    use pretty_assertions::assert_eq;

    fn group(url: &str) -> PoolGroup {
        let options = Arc::new(ConnectionOptions::parse(url).unwrap());
        PoolGroup::new(PoolKey::new(&options, None), options)
    }

    fn provider() -> Arc<dyn ConnectionProvider> {
        Arc::new(MockProvider::default())
    }

    #[test]
    fn test_pool_created_lazily_and_shared() {
        let group = group("postgres://localhost/app");
        let provider = provider();
        let ids = Arc::new(AtomicU64::new(0));

        assert!(group.pool().is_none());
        let first = group.get_pool(&provider, &ids).unwrap();
        let second = group.get_pool(&provider, &ids).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_no_pool_when_pooling_disabled() {
        let group = group("postgres://localhost/app?pooling=false");
        assert!(group.get_pool(&provider(), &Arc::new(AtomicU64::new(0))).is_none());
        assert!(!group.is_disabled());
    }

    #[test]
    fn test_clear_disables_group() {
        let group = group("postgres://localhost/app");
        let provider = provider();
        let ids = Arc::new(AtomicU64::new(0));

        let pool = group.get_pool(&provider, &ids).unwrap();
        let cleared = group.clear().unwrap();
        assert!(Arc::ptr_eq(&pool, &cleared));
        assert!(!pool.is_running());
        assert!(group.is_disabled());
        assert!(group.get_pool(&provider, &ids).is_none());
    }

    #[test]
    fn test_prune_walks_idle_then_disabled() {
        let group = group("postgres://localhost/app");
        let provider = provider();
        let ids = Arc::new(AtomicU64::new(0));
        group.get_pool(&provider, &ids).unwrap();

        let (prunable, released) = group.prune();
        assert!(!prunable);
        assert!(released.is_some());
        assert_eq!(group.state(), GroupState::Idle);

        let (prunable, released) = group.prune();
        assert!(prunable);
        assert!(released.is_none());
        assert_eq!(group.state(), GroupState::Disabled);
    }

    #[test]
    fn test_use_while_idle_reactivates() {
        let group = group("postgres://localhost/app");
        let provider = provider();
        let ids = Arc::new(AtomicU64::new(0));

        let (prunable, _) = group.prune();
        assert!(!prunable);
        assert_eq!(group.state(), GroupState::Idle);

        group.get_pool(&provider, &ids).unwrap();
        assert_eq!(group.state(), GroupState::Active);
        let (prunable, _) = group.prune();
        assert!(!prunable);
    }
}
