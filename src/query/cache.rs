use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::trace;

use super::fixed::{FixedQuery, QuerySettings};
use super::{QueryKey, QueryValue};

/// Projects an argument onto the key that identifies its cache entry.
pub type KeySelector<A, K> = Arc<dyn Fn(&A) -> K + Send + Sync>;

type Entries<A, T, K> = Vec<Arc<FixedQuery<A, T, K>>>;

pub(crate) struct CacheInner<A, T, K> {
    cached: DashMap<K, Arc<FixedQuery<A, T, K>>>,
    uncached: DashMap<K, Entries<A, T, K>>,
    key_selector: KeySelector<A, K>,
    settings: Arc<QuerySettings<A, T>>,
}

impl<A, T, K> CacheInner<A, T, K>
where
    A: QueryValue,
    T: QueryValue,
    K: QueryKey,
{
    /// Removes exactly `entry`, never a different entry sharing its key.
    pub(crate) fn remove(&self, entry: &Arc<FixedQuery<A, T, K>>) {
        if entry.is_cached() {
            if self
                .cached
                .remove_if(entry.key(), |_, current| Arc::ptr_eq(current, entry))
                .is_some()
            {
                trace!(remaining = self.cached.len(), "removed cached entry");
            }
            return;
        }

        let now_empty = match self.uncached.get_mut(entry.key()) {
            Some(mut list) => {
                list.retain(|candidate| !Arc::ptr_eq(candidate, entry));
                list.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.uncached.remove_if(entry.key(), |_, list| list.is_empty());
        }
        trace!("removed uncached entry");
    }
}

/// Keyed store of [`FixedQuery`] entries for one endpoint.
///
/// Cached entries are unique per key and shared by every observer of that key.
/// Uncached entries are created by `trigger` calls, are never shared or looked up
/// for reuse, and are removed as soon as nothing observes them.
///
/// Cloning a `QueryCache` yields another handle to the same store.
pub struct QueryCache<A, T, K = A> {
    inner: Arc<CacheInner<A, T, K>>,
}

impl<A, T, K> QueryCache<A, T, K>
where
    A: QueryValue,
    T: QueryValue,
    K: QueryKey,
{
    pub(crate) fn new(settings: Arc<QuerySettings<A, T>>, key_selector: KeySelector<A, K>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                cached: DashMap::new(),
                uncached: DashMap::new(),
                key_selector,
                settings,
            }),
        }
    }

    pub(crate) fn settings(&self) -> &QuerySettings<A, T> {
        &self.inner.settings
    }

    /// Computes the cache key for an argument.
    pub fn key_of(&self, arg: &A) -> K {
        (self.inner.key_selector)(arg)
    }

    /// Returns the cached entry for `arg`, creating it if absent.
    ///
    /// A new entry is not fetched; that is left to the caller.
    pub fn get_or_add(&self, arg: A) -> Arc<FixedQuery<A, T, K>> {
        let key = self.key_of(&arg);
        match self.inner.cached.entry(key.clone()) {
            Entry::Occupied(existing) if !existing.get().is_evicted() => existing.get().clone(),
            Entry::Occupied(mut evicted) => {
                let query = self.new_entry(arg, key, true);
                evicted.insert(query.clone());
                query
            }
            Entry::Vacant(vacant) => {
                let query = self.new_entry(arg, key, true);
                vacant.insert(query.clone());
                trace!("added cached entry");
                query
            }
        }
    }

    /// Creates a fresh entry that is never shared or reused.
    ///
    /// Its cache time is zero, so it is removed the moment its last observer detaches.
    pub fn add_uncached(&self, arg: A) -> Arc<FixedQuery<A, T, K>> {
        let key = self.key_of(&arg);
        let query = self.new_entry(arg, key.clone(), false);
        self.inner
            .uncached
            .entry(key)
            .or_default()
            .push(query.clone());
        query
    }

    /// Invalidates the cached entry for `arg`, if any.
    pub fn invalidate(&self, arg: &A) {
        if let Some(query) = self.get_cached_query(arg) {
            query.invalidate();
        }
    }

    /// Invalidates every cached entry.
    pub fn invalidate_all(&self) {
        self.invalidate_where(|_| true);
    }

    /// Invalidates every cached entry matching `predicate`.
    pub fn invalidate_where(&self, predicate: impl Fn(&FixedQuery<A, T, K>) -> bool) {
        // Snapshot first so the predicate runs without any shard lock held.
        let entries: Vec<_> = self
            .inner
            .cached
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for query in entries.into_iter().filter(|query| predicate(&**query)) {
            query.invalidate();
        }
    }

    /// Overwrites the data for `arg` without fetching.
    ///
    /// See [`update_query_data_with`](Self::update_query_data_with).
    pub fn update_query_data(&self, arg: &A, data: T, add_if_not_exists: bool) {
        self.update_query_data_with(arg, move |_| data.clone(), add_if_not_exists);
    }

    /// Replaces the data for `arg` with `update(current)` without fetching.
    ///
    /// If no cached entry exists and `add_if_not_exists` is set, a new entry is
    /// created and seeded. The same update is applied to every uncached entry
    /// under the same key so trigger results stay consistent with the cache.
    pub fn update_query_data_with(
        &self,
        arg: &A,
        update: impl Fn(Option<&T>) -> T,
        add_if_not_exists: bool,
    ) {
        let key = self.key_of(arg);
        match self.get_cached_query_by_key(&key) {
            Some(query) => query.update_query_data_with(&update),
            None if add_if_not_exists => {
                let query = self.get_or_add(arg.clone());
                query.update_query_data_with(&update);
                query.schedule_gc_if_unobserved();
            }
            None => {}
        }
        for query in self.uncached_by_key(&key) {
            query.update_query_data_with(&update);
        }
    }

    /// Removes `query` from whichever collection holds it.
    ///
    /// Only the same instance is removed; an entry recreated under the same key
    /// is left alone.
    pub fn remove(&self, query: &Arc<FixedQuery<A, T, K>>) {
        self.inner.remove(query);
    }

    pub fn get_cached_query(&self, arg: &A) -> Option<Arc<FixedQuery<A, T, K>>> {
        self.get_cached_query_by_key(&self.key_of(arg))
    }

    pub fn get_cached_query_by_key(&self, key: &K) -> Option<Arc<FixedQuery<A, T, K>>> {
        self.inner.cached.get(key).map(|entry| entry.value().clone())
    }

    /// Returns the cached entry and every uncached entry for `arg`.
    pub fn get_all_queries(&self, arg: &A) -> Vec<Arc<FixedQuery<A, T, K>>> {
        let key = self.key_of(arg);
        let mut queries: Vec<_> = self.get_cached_query_by_key(&key).into_iter().collect();
        queries.extend(self.uncached_by_key(&key));
        queries
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.cached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.cached.is_empty()
    }

    /// Number of live uncached entries across all keys.
    pub fn uncached_len(&self) -> usize {
        self.inner.uncached.iter().map(|entry| entry.value().len()).sum()
    }

    /// Keys of all cached entries, in no particular order.
    pub fn keys(&self) -> Vec<K> {
        self.inner.cached.iter().map(|entry| entry.key().clone()).collect()
    }

    fn uncached_by_key(&self, key: &K) -> Entries<A, T, K> {
        self.inner
            .uncached
            .get(key)
            .map(|list| list.value().clone())
            .unwrap_or_default()
    }

    fn new_entry(&self, arg: A, key: K, cached: bool) -> Arc<FixedQuery<A, T, K>> {
        let cache_time = if cached {
            self.inner.settings.options.cache_time
        } else {
            Duration::ZERO
        };
        FixedQuery::new(
            arg,
            key,
            cached,
            cache_time,
            Arc::clone(&self.inner.settings),
            Arc::downgrade(&self.inner),
        )
    }
}

impl<A, T, K> Clone for QueryCache<A, T, K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, T, K> fmt::Debug for QueryCache<A, T, K>
where
    K: QueryKey,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("cached", &self.inner.cached.len())
            .field("uncached_keys", &self.inner.uncached.len())
            .finish()
    }
}
