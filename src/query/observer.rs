use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use crate::config::QueryOptions;
use crate::error::QueryError;

use super::cache::QueryCache;
use super::fixed::FixedQuery;
use super::{ObserverId, QueryKey, QueryObserver, QueryStatus, QueryUpdate, QueryValue};

const EVENT_CAPACITY: usize = 64;

/// Notification raised by a [`Query`] observer.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryEvent<A, T> {
    /// Derived state may have changed. Raised after every fetch start or
    /// completion, direct data update, attach and detach.
    StateChanged,
    /// A fetch of the attached entry succeeded and was applied.
    Succeeded { arg: A, value: T },
    /// A fetch of the attached entry failed and was applied.
    Failed { arg: A, error: QueryError },
}

/// Snapshot of the derived state of a [`Query`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<A, T> {
    /// Argument of the attached entry, `None` if no argument was set yet.
    pub arg: Option<A>,
    pub status: QueryStatus,
    /// Data of the attached entry only.
    pub data: Option<T>,
    /// `data` while the entry is successful, else the data of the last entry this
    /// observer saw succeed. Keeps the previous page visible while the next loads.
    pub last_data: Option<T>,
    pub error: Option<QueryError>,
    /// Whether any fetch of the attached entry is in flight.
    pub is_fetching: bool,
}

impl<A, T> QueryResult<A, T> {
    /// Returns `true` during the first load of the attached entry.
    pub const fn is_loading(&self) -> bool {
        matches!(self.status, QueryStatus::Loading)
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.status, QueryStatus::Success)
    }

    pub const fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Error)
    }

    /// Returns `true` if the query succeeded and holds data.
    pub const fn has_data(&self) -> bool {
        matches!(self.status, QueryStatus::Success) && self.data.is_some()
    }

    /// Returns `true` if no argument has been set yet.
    pub const fn is_uninitialized(&self) -> bool {
        self.arg.is_none()
    }
}

impl<A, T> Default for QueryResult<A, T> {
    fn default() -> Self {
        Self {
            arg: None,
            status: QueryStatus::Idle,
            data: None,
            last_data: None,
            error: None,
            is_fetching: false,
        }
    }
}

struct Attachment<A, T, K> {
    current: Option<Arc<FixedQuery<A, T, K>>>,
    last_successful: Option<Arc<FixedQuery<A, T, K>>>,
}

struct ObserverInner<A, T, K> {
    id: ObserverId,
    attachment: Mutex<Attachment<A, T, K>>,
    events: broadcast::Sender<QueryEvent<A, T>>,
    options: QueryOptions<A, T>,
}

impl<A, T, K> ObserverInner<A, T, K> {
    fn emit(&self, event: QueryEvent<A, T>) {
        // No receivers is fine: nobody is listening.
        let _ = self.events.send(event);
    }
}

impl<A, T, K> QueryObserver<A, T, K> for ObserverInner<A, T, K>
where
    A: QueryValue,
    T: QueryValue,
    K: QueryKey,
{
    fn on_update(&self, query: &Arc<FixedQuery<A, T, K>>, update: &QueryUpdate<T>) {
        {
            let mut attachment = self.attachment.lock();
            let is_current = attachment
                .current
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, query));
            if !is_current {
                return;
            }
            if matches!(update, QueryUpdate::Succeeded(_)) {
                attachment.last_successful = Some(Arc::clone(query));
            }
        }

        self.emit(QueryEvent::StateChanged);
        match update {
            QueryUpdate::Succeeded(value) => {
                if let Some(hook) = &self.options.on_success {
                    hook(query.arg(), value);
                }
                self.emit(QueryEvent::Succeeded {
                    arg: query.arg().clone(),
                    value: value.clone(),
                });
            }
            QueryUpdate::Failed(error) => {
                if let Some(hook) = &self.options.on_failure {
                    hook(query.arg(), error);
                }
                self.emit(QueryEvent::Failed {
                    arg: query.arg().clone(),
                    error: error.clone(),
                });
            }
            _ => {}
        }
    }
}

/// A per-consumer handle bound to an endpoint's cache.
///
/// A `Query` observes at most one entry at a time. Setting an argument attaches it
/// to the entry for that argument, fetching if the entry is stale, and detaches it
/// from the previous one. Dropping the `Query` detaches it.
///
/// # Example
///
/// ```rust
/// use querybind::{Endpoint, QueryError};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), QueryError> {
/// let endpoint = Endpoint::new(|id: u32, _token| async move { Ok(format!("user-{id}")) });
/// let query = endpoint.use_query();
///
/// let user = query.set_arg_async(7).await?;
/// assert_eq!(user, "user-7");
/// assert!(query.result().has_data());
/// # Ok(())
/// # }
/// ```
pub struct Query<A, T, K = A>
where
    A: QueryValue,
    T: QueryValue,
    K: QueryKey,
{
    inner: Arc<ObserverInner<A, T, K>>,
    cache: QueryCache<A, T, K>,
    stale_time: Duration,
}

impl<A, T, K> Query<A, T, K>
where
    A: QueryValue,
    T: QueryValue,
    K: QueryKey,
{
    pub(crate) fn new(cache: QueryCache<A, T, K>, options: QueryOptions<A, T>) -> Self {
        let stale_time = options
            .stale_time
            .unwrap_or(cache.settings().options.default_stale_time);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ObserverInner {
                id: ObserverId::next(),
                attachment: Mutex::new(Attachment {
                    current: None,
                    last_successful: None,
                }),
                events,
                options,
            }),
            cache,
            stale_time,
        }
    }

    pub fn id(&self) -> ObserverId {
        self.inner.id
    }

    /// Stale time this observer applies when attaching to an entry.
    pub const fn stale_time(&self) -> Duration {
        self.stale_time
    }

    /// Sets the argument without waiting for the outcome.
    ///
    /// # Panics
    ///
    /// Panics if a fetch has to start outside of a Tokio runtime.
    pub fn set_arg(&self, arg: A) {
        let _ = self.set_arg_async(arg);
    }

    /// Attaches to the entry for `arg` and resolves to its value.
    ///
    /// Attaching happens immediately, before the returned future is polled. If the
    /// entry is stale and not already fetching, a fetch starts; otherwise the
    /// future resolves to the in-flight or current outcome. Setting the argument
    /// the observer is already attached to starts no new work unless that entry is
    /// idle.
    pub fn set_arg_async(&self, arg: A) -> BoxFuture<'static, Result<T, QueryError>> {
        if let Some(current) = self.current() {
            // An idle entry has nothing to settle on, e.g. after its first load was cancelled.
            if current.is_cached()
                && !current.is_evicted()
                && current.status() != QueryStatus::Idle
                && *current.key() == self.cache.key_of(&arg)
            {
                trace!("argument unchanged");
                return current.settled();
            }
        }
        let query = self.attach(|| self.cache.get_or_add(arg.clone()));
        query.fetch_if_stale(self.stale_time)
    }

    /// Refetches the attached entry without waiting for the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidOperation`] if no argument has been set.
    pub fn refetch(&self) -> Result<(), QueryError> {
        let query = self.current().ok_or_else(Self::no_argument)?;
        let _ = query.refetch();
        Ok(())
    }

    /// Refetches the attached entry and resolves to the outcome of that fetch.
    ///
    /// Resolves to [`QueryError::InvalidOperation`] if no argument has been set.
    pub fn refetch_async(&self) -> BoxFuture<'static, Result<T, QueryError>> {
        match self.current() {
            Some(query) => query.refetch().into_future().boxed(),
            None => future::ready(Err(Self::no_argument())).boxed(),
        }
    }

    /// Runs the fetch for `arg` on a fresh unshared entry without waiting.
    pub fn trigger(&self, arg: A) {
        let _ = self.trigger_async(arg);
    }

    /// Runs the fetch for `arg` on a fresh unshared entry.
    ///
    /// The shared cache is bypassed entirely: the fetch always runs and its result
    /// never overwrites the cached entry for the same key.
    pub fn trigger_async(&self, arg: A) -> BoxFuture<'static, Result<T, QueryError>> {
        let query = self.attach(|| self.cache.add_uncached(arg.clone()));
        query.refetch().into_future().boxed()
    }

    /// Requests cancellation of the attached entry's in-flight fetches.
    pub fn cancel(&self) {
        if let Some(query) = self.current() {
            query.cancel();
        }
    }

    /// Detaches from the current entry so it can be garbage collected.
    ///
    /// Calling this on a detached observer does nothing.
    pub fn detach(&self) {
        let previous = {
            let mut attachment = self.inner.attachment.lock();
            attachment.last_successful = None;
            attachment.current.take()
        };
        if let Some(previous) = previous {
            previous.remove_observer(self.inner.id);
            self.inner.emit(QueryEvent::StateChanged);
        }
    }

    /// The currently attached entry.
    pub fn current(&self) -> Option<Arc<FixedQuery<A, T, K>>> {
        self.inner.attachment.lock().current.clone()
    }

    /// Snapshot of the derived state.
    pub fn result(&self) -> QueryResult<A, T> {
        let (current, last_successful) = {
            let attachment = self.inner.attachment.lock();
            (
                attachment.current.clone(),
                attachment.last_successful.clone(),
            )
        };
        let Some(current) = current else {
            return QueryResult::default();
        };
        let status = current.status();
        let data = current.data();
        let last_data = if status == QueryStatus::Success {
            data.clone()
        } else {
            last_successful.and_then(|query| query.data())
        };
        QueryResult {
            arg: Some(current.arg().clone()),
            status,
            data,
            last_data,
            error: current.error(),
            is_fetching: current.is_fetching(),
        }
    }

    pub fn arg(&self) -> Option<A> {
        self.current().map(|query| query.arg().clone())
    }

    pub fn status(&self) -> QueryStatus {
        self.current().map_or(QueryStatus::Idle, |query| query.status())
    }

    pub fn data(&self) -> Option<T> {
        self.current().and_then(|query| query.data())
    }

    pub fn last_data(&self) -> Option<T> {
        self.result().last_data
    }

    pub fn error(&self) -> Option<QueryError> {
        self.current().and_then(|query| query.error())
    }

    pub fn is_loading(&self) -> bool {
        self.status() == QueryStatus::Loading
    }

    pub fn is_fetching(&self) -> bool {
        self.current().is_some_and(|query| query.is_fetching())
    }

    pub fn is_success(&self) -> bool {
        self.status() == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status() == QueryStatus::Error
    }

    pub fn has_data(&self) -> bool {
        self.result().has_data()
    }

    pub fn is_uninitialized(&self) -> bool {
        self.current().is_none()
    }

    /// Subscribes to this observer's events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueryEvent<A, T>> {
        self.inner.events.subscribe()
    }

    /// This observer's events as a stream. Lagged events are skipped.
    pub fn events(&self) -> BoxStream<'static, QueryEvent<A, T>> {
        BroadcastStream::new(self.subscribe())
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }

    /// Attaches to the entry produced by `resolve`, detaching from the previous one.
    fn attach(&self, resolve: impl Fn() -> Arc<FixedQuery<A, T, K>>) -> Arc<FixedQuery<A, T, K>> {
        let observer: Arc<dyn QueryObserver<A, T, K>> = self.inner.clone();
        let mut attachment = self.inner.attachment.lock();
        let query = loop {
            let query = resolve();
            let already_attached = attachment
                .current
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &query));
            if already_attached {
                return query;
            }
            if query.add_observer(self.inner.id, Arc::clone(&observer)) {
                break query;
            }
            trace!("entry evicted while attaching, resolving again");
        };

        if let Some(previous) = attachment.current.replace(Arc::clone(&query)) {
            if previous.status() == QueryStatus::Success {
                attachment.last_successful = Some(Arc::clone(&previous));
            }
            previous.remove_observer(self.inner.id);
        }
        if query.status() == QueryStatus::Success {
            attachment.last_successful = Some(Arc::clone(&query));
        }
        drop(attachment);

        self.inner.emit(QueryEvent::StateChanged);
        query
    }

    fn no_argument() -> QueryError {
        QueryError::InvalidOperation("no argument has been set for this query".to_string())
    }
}

impl<A, T, K> Drop for Query<A, T, K>
where
    A: QueryValue,
    T: QueryValue,
    K: QueryKey,
{
    fn drop(&mut self) {
        self.detach();
    }
}

impl<A, T, K> fmt::Debug for Query<A, T, K>
where
    A: QueryValue,
    T: QueryValue,
    K: QueryKey,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.inner.id)
            .field("stale_time", &self.stale_time)
            .field("attached", &self.inner.attachment.lock().current.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: QueryStatus, data: Option<i32>) -> QueryResult<u32, i32> {
        QueryResult {
            arg: Some(1),
            status,
            data,
            last_data: None,
            error: None,
            is_fetching: false,
        }
    }

    #[test]
    fn test_query_result_default_is_uninitialized() {
        let result = QueryResult::<u32, i32>::default();
        assert!(result.is_uninitialized());
        assert_eq!(result.status, QueryStatus::Idle);
        assert!(!result.has_data());
    }

    #[test]
    fn test_query_result_predicates() {
        let loading = result(QueryStatus::Loading, None);
        assert!(loading.is_loading());
        assert!(!loading.is_success());
        assert!(!loading.is_error());
        assert!(!loading.has_data());

        let success = result(QueryStatus::Success, Some(42));
        assert!(!success.is_loading());
        assert!(success.is_success());
        assert!(!success.is_error());
        assert!(success.has_data());
        assert!(!success.is_uninitialized());

        let empty_success = result(QueryStatus::Success, None);
        assert!(empty_success.is_success());
        assert!(!empty_success.has_data());

        let error = result(QueryStatus::Error, Some(42));
        assert!(!error.is_loading());
        assert!(!error.is_success());
        assert!(error.is_error());
        assert!(!error.has_data());
    }
}
