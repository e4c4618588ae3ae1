//! Endpoints: one fetch function bound to one configuration and one cache.
//!
//! An [`Endpoint`] is the entry point of the crate. It owns the [`QueryCache`] for
//! its fetch function, hands out [`Query`] observers that share that cache, and
//! exposes the cache-wide operations: invalidation, prefetching and direct data
//! updates.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use querybind::{Endpoint, EndpointOptions, QueryError};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), QueryError> {
//! let users = Endpoint::with_options(
//!     |id: u32, _token| async move { Ok(format!("user-{id}")) },
//!     EndpointOptions::default().with_default_stale_time(Duration::from_secs(30)),
//! );
//!
//! // Warm the cache before anything observes the entry.
//! users.prefetch_async(1).await?;
//!
//! let query = users.use_query();
//! assert_eq!(query.set_arg_async(1).await?, "user-1");
//!
//! // Force observers of every entry to refetch.
//! users.invalidate_all();
//! # Ok(())
//! # }
//! ```

mod mutation;

use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Unit;
use crate::config::{EndpointOptions, QueryOptions};
use crate::error::QueryError;
use crate::query::{
    FetchFn, FixedQuery, Query, QueryCache, QueryKey, QuerySettings, QueryStatus, QueryValue,
};

pub use mutation::MutationEndpoint;

/// A fetch function bound to its configuration and cache.
///
/// Cloning an `Endpoint` is cheap and yields a handle to the same cache.
pub struct Endpoint<A, T, K = A> {
    cache: QueryCache<A, T, K>,
}

impl<A, T> Endpoint<A, T, A>
where
    A: QueryKey,
    T: QueryValue,
{
    /// Creates an endpoint with default options, keyed by the argument itself.
    pub fn new<F, Fut>(fetch: F) -> Self
    where
        F: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        Self::with_options(fetch, EndpointOptions::default())
    }

    /// Creates an endpoint keyed by the argument itself.
    pub fn with_options<F, Fut>(fetch: F, options: EndpointOptions<A, T>) -> Self
    where
        F: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        Self::with_key_selector(fetch, options, A::clone)
    }
}

impl<T> Endpoint<Unit, T>
where
    T: QueryValue,
{
    /// Creates an endpoint whose fetch takes no argument.
    ///
    /// Observers fetch through [`Query::fetch`] instead of `set_arg(())`.
    pub fn parameterless<F, Fut>(fetch: F, options: EndpointOptions<Unit, T>) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        Self::with_options(move |(), token| fetch(token), options)
    }
}

impl<T> Query<Unit, T>
where
    T: QueryValue,
{
    /// Attaches to the single entry of a parameterless endpoint without waiting.
    pub fn fetch(&self) {
        self.set_arg(());
    }

    /// Attaches to the single entry of a parameterless endpoint and resolves to its value.
    pub fn fetch_async(&self) -> BoxFuture<'static, Result<T, QueryError>> {
        self.set_arg_async(())
    }
}

impl<A, T, K> Endpoint<A, T, K>
where
    A: QueryValue,
    T: QueryValue,
    K: QueryKey,
{
    /// Creates an endpoint whose entries are keyed by `key_selector(arg)`.
    ///
    /// Use this when the argument is not hashable, or when several arguments
    /// should share one entry.
    pub fn with_key_selector<F, Fut, S>(
        fetch: F,
        options: EndpointOptions<A, T>,
        key_selector: S,
    ) -> Self
    where
        F: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
        S: Fn(&A) -> K + Send + Sync + 'static,
    {
        let fetch: FetchFn<A, T> = Arc::new(move |arg, token| fetch(arg, token).boxed());
        let settings = Arc::new(QuerySettings { fetch, options });
        Self {
            cache: QueryCache::new(settings, Arc::new(key_selector)),
        }
    }

    pub fn options(&self) -> &EndpointOptions<A, T> {
        &self.cache.settings().options
    }

    pub const fn cache(&self) -> &QueryCache<A, T, K> {
        &self.cache
    }

    /// Creates an observer using the endpoint's default stale time.
    pub fn use_query(&self) -> Query<A, T, K> {
        self.use_query_with(QueryOptions::default())
    }

    /// Creates an observer with its own stale time and hooks.
    pub fn use_query_with(&self, options: QueryOptions<A, T>) -> Query<A, T, K> {
        Query::new(self.cache.clone(), options)
    }

    /// Invalidates the entry for `arg`. Observed entries refetch at once.
    pub fn invalidate(&self, arg: &A) {
        self.cache.invalidate(arg);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn invalidate_where(&self, predicate: impl Fn(&FixedQuery<A, T, K>) -> bool) {
        self.cache.invalidate_where(predicate);
    }

    /// Replaces the data for `arg` without fetching.
    ///
    /// When no entry exists for `arg`, one is created only if `add_if_not_exists`.
    pub fn update_query_data(&self, arg: &A, data: T, add_if_not_exists: bool) {
        self.cache.update_query_data(arg, data, add_if_not_exists);
    }

    /// Derives new data for `arg` from the current data without fetching.
    pub fn update_query_data_with(
        &self,
        arg: &A,
        update: impl Fn(Option<&T>) -> T,
        add_if_not_exists: bool,
    ) {
        self.cache
            .update_query_data_with(arg, update, add_if_not_exists);
    }

    /// Populates the cache in the background without attaching an observer.
    ///
    /// # Panics
    ///
    /// Panics if a fetch has to start outside of a Tokio runtime.
    pub fn prefetch(&self, arg: A) {
        let _ = self.prefetch_async(arg);
    }

    /// Populates the cache without attaching an observer and resolves to the value.
    ///
    /// An entry that is loading or already successful is not fetched again; the
    /// returned future resolves to its in-flight or current outcome instead.
    pub fn prefetch_async(&self, arg: A) -> BoxFuture<'static, Result<T, QueryError>> {
        let query = self.cache.get_or_add(arg);
        match query.status() {
            QueryStatus::Loading | QueryStatus::Success => query.settled(),
            QueryStatus::Idle | QueryStatus::Error => {
                debug!("prefetching entry");
                let invocation = query.refetch();
                query.schedule_gc_if_unobserved();
                invocation.into_future().boxed()
            }
        }
    }

    /// Runs the raw fetch function, bypassing the cache, dedup and retries.
    pub fn invoke(&self, arg: A) -> BoxFuture<'static, Result<T, QueryError>> {
        (self.cache.settings().fetch)(arg, CancellationToken::new())
    }

    pub fn get_cached_query(&self, arg: &A) -> Option<Arc<FixedQuery<A, T, K>>> {
        self.cache.get_cached_query(arg)
    }

    /// Returns the cached data for `arg` if its entry is successful.
    pub fn try_get_cached_result(&self, arg: &A) -> Option<T> {
        self.cache
            .get_cached_query(arg)
            .filter(|query| query.status() == QueryStatus::Success)
            .and_then(|query| query.data())
    }
}

impl<A, T, K> Clone for Endpoint<A, T, K> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

impl<A, T, K> fmt::Debug for Endpoint<A, T, K>
where
    A: QueryValue,
    T: QueryValue,
    K: QueryKey,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("options", self.options())
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_endpoint(
        options: EndpointOptions<u32, String>,
    ) -> (Endpoint<u32, String>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let endpoint = Endpoint::with_options(
            move |n: u32, _token| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(n.to_string()) }
            },
            options,
        );
        (endpoint, calls)
    }

    #[tokio::test]
    async fn test_prefetch_populates_cache_without_observer() {
        let (endpoint, calls) = counting_endpoint(EndpointOptions::default());

        let value = endpoint.prefetch_async(3).await;
        assert_eq!(value, Ok("3".to_string()));
        assert_eq!(endpoint.try_get_cached_result(&3), Some("3".to_string()));

        let query = endpoint
            .get_cached_query(&3)
            .expect("prefetched entry should be cached");
        assert_eq!(query.observer_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_prefetch_reuses_successful_entry() {
        let (endpoint, calls) = counting_endpoint(EndpointOptions::default());

        endpoint.prefetch_async(3).await.expect("first prefetch");
        endpoint.prefetch_async(3).await.expect("second prefetch");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_prefetch_shares_invocation() {
        let (endpoint, calls) = counting_endpoint(EndpointOptions::default());

        let first = endpoint.prefetch_async(4);
        let second = endpoint.prefetch_async(4);
        assert_eq!(first.await, Ok("4".to_string()));
        assert_eq!(second.await, Ok("4".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invoke_bypasses_cache() {
        let (endpoint, calls) = counting_endpoint(EndpointOptions::default());

        assert_eq!(endpoint.invoke(8).await, Ok("8".to_string()));
        assert_eq!(endpoint.invoke(8).await, Ok("8".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(endpoint.get_cached_query(&8).is_none());
    }

    #[tokio::test]
    async fn test_try_get_cached_result_requires_success() {
        let endpoint: Endpoint<u32, String> = Endpoint::new(|n: u32, _token| async move {
            Err(QueryError::fetch(format!("no user {n}")))
        });

        let query = endpoint.use_query();
        let result = query.set_arg_async(1).await;
        assert_eq!(result, Err(QueryError::fetch("no user 1")));
        assert!(endpoint.get_cached_query(&1).is_some());
        assert_eq!(endpoint.try_get_cached_result(&1), None);
    }

    #[tokio::test]
    async fn test_key_selector_shares_entries() {
        let endpoint = Endpoint::with_key_selector(
            |(id, _page): (u32, u32), _token| async move { Ok(id * 10) },
            EndpointOptions::default().with_default_stale_time(Duration::MAX),
            |(id, _page): &(u32, u32)| *id,
        );

        let first = endpoint.use_query();
        assert_eq!(first.set_arg_async((1, 1)).await, Ok(10));

        let second = endpoint.use_query();
        assert_eq!(second.set_arg_async((1, 2)).await, Ok(10));
        assert!(Arc::ptr_eq(
            &first.current().expect("attached"),
            &second.current().expect("attached"),
        ));
    }

    #[tokio::test]
    async fn test_parameterless_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let endpoint = Endpoint::parameterless(
            move |_token| {
                let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(call) }
            },
            EndpointOptions::default().with_default_stale_time(Duration::MAX),
        );

        let query = endpoint.use_query();
        assert_eq!(query.fetch_async().await, Ok(1));
        assert_eq!(query.fetch_async().await, Ok(1));
        assert_eq!(query.refetch_async().await, Ok(2));
        assert_eq!(endpoint.try_get_cached_result(&()), Some(2));
    }

    #[test]
    fn test_options_are_exposed() {
        let (endpoint, _) = counting_endpoint(
            EndpointOptions::new(Duration::from_secs(60), Duration::from_secs(5)),
        );
        assert_eq!(endpoint.options().cache_time, Duration::from_secs(60));
        assert_eq!(endpoint.options().default_stale_time, Duration::from_secs(5));
        assert!(endpoint.cache().is_empty());
    }
}
