use std::collections::HashMap;
use std::fmt;
use std::future::IntoFuture;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{self, BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::EndpointOptions;
use crate::error::QueryError;
use crate::retry::Operation;

use super::cache::CacheInner;
use super::{ObserverId, QueryKey, QueryObserver, QueryStatus, QueryUpdate, QueryValue};

/// The user-supplied fetch: argument and cancellation token in, result out.
pub type FetchFn<A, T> =
    Arc<dyn Fn(A, CancellationToken) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

/// Fetch function and options shared by every entry of one endpoint.
pub(crate) struct QuerySettings<A, T> {
    pub(crate) fetch: FetchFn<A, T>,
    pub(crate) options: EndpointOptions<A, T>,
}

/// A started fetch of a [`FixedQuery`].
///
/// Invocations are cheap to clone and can be awaited any number of times; each
/// await yields the outcome of this particular fetch, whether or not it was the
/// one applied to the entry.
pub struct Invocation<T> {
    seq: u64,
    started_at: Instant,
    outcome: Shared<BoxFuture<'static, Result<T, QueryError>>>,
}

impl<T> Invocation<T> {
    /// Position of this fetch in the entry's start order. Later fetches have larger values.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub const fn started_at(&self) -> Instant {
        self.started_at
    }
}

impl<T: Clone> Invocation<T> {
    /// Returns the outcome if the fetch has already finished.
    #[must_use]
    pub fn peek(&self) -> Option<&Result<T, QueryError>> {
        self.outcome.peek()
    }
}

impl<T: Clone> Clone for Invocation<T> {
    fn clone(&self) -> Self {
        Self {
            seq: self.seq,
            started_at: self.started_at,
            outcome: self.outcome.clone(),
        }
    }
}

impl<T: Clone> IntoFuture for Invocation<T> {
    type Output = Result<T, QueryError>;
    type IntoFuture = Shared<BoxFuture<'static, Result<T, QueryError>>>;

    fn into_future(self) -> Self::IntoFuture {
        self.outcome
    }
}

impl<T> fmt::Debug for Invocation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("seq", &self.seq)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

type ObserverSet<A, T, K> = HashMap<ObserverId, Arc<dyn QueryObserver<A, T, K>>>;

struct EntryState<A, T, K> {
    status: QueryStatus,
    data: Option<T>,
    error: Option<QueryError>,
    last_invocation: Option<Invocation<T>>,
    in_flight: HashMap<u64, CancellationToken>,
    next_seq: u64,
    // Sequence number of the fetch whose outcome is currently applied, 0 if none.
    last_applied_seq: u64,
    last_applied_started_at: Option<Instant>,
    data_updated_at: Option<Instant>,
    is_invalidated: bool,
    observers: ObserverSet<A, T, K>,
    gc_timer: Option<AbortHandle>,
    gc_generation: u64,
    evicted: bool,
}

/// Cache entry for one argument key: the authoritative state for that key.
///
/// Only the most recently started fetch may change `status`, `data` and `error`.
/// A fetch that finishes after a newer one was applied is discarded, although its
/// own caller still receives its outcome.
pub struct FixedQuery<A, T, K> {
    arg: A,
    key: K,
    cached: bool,
    cache_time: Duration,
    settings: Arc<QuerySettings<A, T>>,
    cache: Weak<CacheInner<A, T, K>>,
    state: Mutex<EntryState<A, T, K>>,
}

impl<A, T, K> FixedQuery<A, T, K>
where
    A: QueryValue,
    T: QueryValue,
    K: QueryKey,
{
    pub(crate) fn new(
        arg: A,
        key: K,
        cached: bool,
        cache_time: Duration,
        settings: Arc<QuerySettings<A, T>>,
        cache: Weak<CacheInner<A, T, K>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            arg,
            key,
            cached,
            cache_time,
            settings,
            cache,
            state: Mutex::new(EntryState {
                status: QueryStatus::Idle,
                data: None,
                error: None,
                last_invocation: None,
                in_flight: HashMap::new(),
                next_seq: 0,
                last_applied_seq: 0,
                last_applied_started_at: None,
                data_updated_at: None,
                is_invalidated: false,
                observers: HashMap::new(),
                gc_timer: None,
                gc_generation: 0,
                evicted: false,
            }),
        })
    }

    /// The full argument this entry fetches with.
    pub const fn arg(&self) -> &A {
        &self.arg
    }

    pub const fn key(&self) -> &K {
        &self.key
    }

    /// Returns `true` for shared entries, `false` for entries created by `trigger`.
    pub const fn is_cached(&self) -> bool {
        self.cached
    }

    pub const fn cache_time(&self) -> Duration {
        self.cache_time
    }

    pub fn status(&self) -> QueryStatus {
        self.state.lock().status
    }

    /// Last successfully fetched or directly updated data. Survives later failures.
    pub fn data(&self) -> Option<T> {
        self.state.lock().data.clone()
    }

    /// Error of the last applied failure, cleared by the next success.
    pub fn error(&self) -> Option<QueryError> {
        self.state.lock().error.clone()
    }

    /// Returns `true` while any fetch of this entry is in flight.
    pub fn is_fetching(&self) -> bool {
        !self.state.lock().in_flight.is_empty()
    }

    pub fn is_invalidated(&self) -> bool {
        self.state.lock().is_invalidated
    }

    pub fn data_updated_at(&self) -> Option<Instant> {
        self.state.lock().data_updated_at
    }

    /// Start instant of the fetch whose outcome is currently applied.
    pub fn last_completed_started_at(&self) -> Option<Instant> {
        self.state.lock().last_applied_started_at
    }

    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    /// The most recently started fetch, if any.
    pub fn last_invocation(&self) -> Option<Invocation<T>> {
        self.state.lock().last_invocation.clone()
    }

    /// Returns `true` once garbage collection has removed this entry from its cache.
    pub fn is_evicted(&self) -> bool {
        self.state.lock().evicted
    }

    /// Starts a new fetch and returns a handle to its outcome.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn refetch(self: &Arc<Self>) -> Invocation<T> {
        let (invocation, observers) = {
            let mut state = self.state.lock();
            let invocation = self.start_locked(&mut state);
            (invocation, Self::observers_of(&state))
        };
        self.notify(observers, &QueryUpdate::Started);
        invocation
    }

    /// Marks the entry as no longer current.
    ///
    /// An observed entry refetches immediately. An unobserved entry is only
    /// flagged, so the next observer to attach sees it as stale.
    pub fn invalidate(self: &Arc<Self>) {
        let observed = {
            let mut state = self.state.lock();
            if state.observers.is_empty() {
                state.is_invalidated = true;
                false
            } else {
                true
            }
        };
        if observed {
            debug!("invalidated observed entry, refetching");
            let _ = self.refetch();
        } else {
            trace!("invalidated unobserved entry");
        }
    }

    /// Checks whether the data must be refreshed before it is considered current.
    ///
    /// Data is stale if the entry was invalidated, never received data, or was last
    /// updated `stale_time` or longer before `now`. A zero stale time therefore
    /// makes data stale immediately; `Duration::MAX` never expires.
    pub fn is_stale_by_time(&self, stale_time: Duration, now: Instant) -> bool {
        Self::is_stale_locked(&self.state.lock(), stale_time, now)
    }

    /// Replaces the data without running the fetch.
    pub fn update_query_data(self: &Arc<Self>, data: T) {
        self.update_query_data_with(move |_| data);
    }

    /// Replaces the data with `update(current)` without running the fetch.
    ///
    /// An idle entry becomes `Success`. Observers are told the data changed but no
    /// success event is raised, since nothing was fetched.
    pub fn update_query_data_with(self: &Arc<Self>, update: impl FnOnce(Option<&T>) -> T) {
        let observers = {
            let mut state = self.state.lock();
            let data = update(state.data.as_ref());
            state.data = Some(data);
            state.data_updated_at = Some(Instant::now());
            if state.status == QueryStatus::Idle {
                state.status = QueryStatus::Success;
            }
            Self::observers_of(&state)
        };
        self.notify(observers, &QueryUpdate::DataUpdated);
    }

    /// Requests cancellation of every in-flight fetch.
    pub fn cancel(&self) {
        let state = self.state.lock();
        for (seq, token) in &state.in_flight {
            debug!(seq, "cancelling fetch");
            token.cancel();
        }
    }

    /// Attaches an observer and disarms any pending garbage collection.
    ///
    /// Returns `false` if the entry has already been evicted; the caller should
    /// resolve a fresh entry from the cache instead.
    pub fn add_observer(&self, id: ObserverId, observer: Arc<dyn QueryObserver<A, T, K>>) -> bool {
        let mut state = self.state.lock();
        if state.evicted {
            return false;
        }
        state.observers.insert(id, observer);
        state.gc_generation += 1;
        if let Some(timer) = state.gc_timer.take() {
            timer.abort();
            trace!("disarmed GC timer");
        }
        true
    }

    /// Detaches an observer. Detaching the last one arms garbage collection.
    pub fn remove_observer(self: &Arc<Self>, id: ObserverId) {
        let evict_now = {
            let mut state = self.state.lock();
            if state.observers.remove(&id).is_none() || !state.observers.is_empty() {
                return;
            }
            self.arm_gc_locked(&mut state)
        };
        if evict_now {
            self.evict();
        }
    }

    /// Starts a fetch if none is running and the data is stale; otherwise resolves
    /// to the in-flight or current outcome without starting new work.
    pub(crate) fn fetch_if_stale(
        self: &Arc<Self>,
        stale_time: Duration,
    ) -> BoxFuture<'static, Result<T, QueryError>> {
        let (invocation, observers) = {
            let mut state = self.state.lock();
            if !state.in_flight.is_empty()
                || !Self::is_stale_locked(&state, stale_time, Instant::now())
            {
                return Self::settled_locked(&state);
            }
            let invocation = self.start_locked(&mut state);
            (invocation, Self::observers_of(&state))
        };
        self.notify(observers, &QueryUpdate::Started);
        invocation.into_future().boxed()
    }

    /// Resolves to the in-flight fetch if there is one, else to the current outcome.
    pub(crate) fn settled(&self) -> BoxFuture<'static, Result<T, QueryError>> {
        Self::settled_locked(&self.state.lock())
    }

    /// Arms garbage collection for an entry nobody has attached to yet.
    pub(crate) fn schedule_gc_if_unobserved(self: &Arc<Self>) {
        let evict_now = {
            let mut state = self.state.lock();
            if !state.observers.is_empty() || state.gc_timer.is_some() {
                return;
            }
            self.arm_gc_locked(&mut state)
        };
        if evict_now {
            self.evict();
        }
    }

    fn start_locked(self: &Arc<Self>, state: &mut EntryState<A, T, K>) -> Invocation<T> {
        state.next_seq += 1;
        let seq = state.next_seq;
        let token = CancellationToken::new();
        if state.status != QueryStatus::Success {
            state.status = QueryStatus::Loading;
        }
        state.in_flight.insert(seq, token.clone());

        let started_at = Instant::now();
        let entry = Arc::clone(self);
        let handle = tokio::spawn(async move { entry.run(seq, started_at, token).await });
        let outcome = async move { handle.await.unwrap_or_else(|err| Err(err.into())) }
            .boxed()
            .shared();

        debug!(seq, in_flight = state.in_flight.len(), "starting fetch");
        let invocation = Invocation {
            seq,
            started_at,
            outcome,
        };
        state.last_invocation = Some(invocation.clone());
        invocation
    }

    async fn run(
        self: Arc<Self>,
        seq: u64,
        started_at: Instant,
        token: CancellationToken,
    ) -> Result<T, QueryError> {
        let fetch = Arc::clone(&self.settings.fetch);
        let arg = self.arg.clone();
        let operation: Operation<T> = Arc::new(move |token| fetch(arg.clone(), token));
        let attempt = match &self.settings.options.retry_handler {
            Some(handler) => handler.execute(operation, token.clone()),
            None => operation(token.clone()),
        };

        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => Err(QueryError::Cancelled),
            outcome = AssertUnwindSafe(attempt).catch_unwind() => outcome.unwrap_or_else(|_| {
                Err(QueryError::TaskFailed("fetch panicked".to_string()))
            }),
        };

        self.complete(seq, started_at, &outcome);
        outcome
    }

    fn complete(self: &Arc<Self>, seq: u64, started_at: Instant, outcome: &Result<T, QueryError>) {
        let (update, observers) = {
            let mut state = self.state.lock();
            state.in_flight.remove(&seq);
            let update = match outcome {
                Err(QueryError::Cancelled) => {
                    if state.in_flight.is_empty() && state.status == QueryStatus::Loading {
                        state.status = if state.error.is_some() {
                            QueryStatus::Error
                        } else if state.data.is_some() {
                            QueryStatus::Success
                        } else {
                            QueryStatus::Idle
                        };
                    }
                    debug!(seq, status = ?state.status, "fetch cancelled");
                    QueryUpdate::Cancelled
                }
                _ if seq <= state.last_applied_seq => {
                    debug!(
                        seq,
                        applied = state.last_applied_seq,
                        "discarding superseded fetch outcome"
                    );
                    QueryUpdate::Superseded
                }
                Ok(value) => {
                    state.status = QueryStatus::Success;
                    state.data = Some(value.clone());
                    state.error = None;
                    state.data_updated_at = Some(Instant::now());
                    state.is_invalidated = false;
                    state.last_applied_seq = seq;
                    state.last_applied_started_at = Some(started_at);
                    debug!(seq, "applied fetch result");
                    QueryUpdate::Succeeded(value.clone())
                }
                Err(error) => {
                    state.status = QueryStatus::Error;
                    state.error = Some(error.clone());
                    state.last_applied_seq = seq;
                    state.last_applied_started_at = Some(started_at);
                    debug!(seq, %error, "applied fetch failure");
                    QueryUpdate::Failed(error.clone())
                }
            };
            (update, Self::observers_of(&state))
        };

        let options = &self.settings.options;
        match outcome {
            Ok(value) => {
                if let Some(hook) = &options.on_success {
                    hook(&self.arg, value);
                }
            }
            Err(error) if !error.is_cancelled() => {
                if let Some(hook) = &options.on_failure {
                    hook(&self.arg, error);
                }
            }
            Err(_) => {}
        }

        self.notify(observers, &update);
    }

    /// Returns `true` if the entry must be evicted right away.
    fn arm_gc_locked(self: &Arc<Self>, state: &mut EntryState<A, T, K>) -> bool {
        if state.evicted || self.cache_time == Duration::MAX {
            return false;
        }
        if self.cache_time.is_zero() {
            state.evicted = true;
            return true;
        }
        let Ok(runtime) = Handle::try_current() else {
            debug!("no runtime to run GC timer, evicting now");
            state.evicted = true;
            return true;
        };

        state.gc_generation += 1;
        let generation = state.gc_generation;
        let delay = self.cache_time;
        let entry = Arc::downgrade(self);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(entry) = entry.upgrade() {
                entry.gc_fire(generation);
            }
        });
        if let Some(previous) = state.gc_timer.replace(timer.abort_handle()) {
            previous.abort();
        }
        trace!(?delay, "armed GC timer");
        false
    }

    fn gc_fire(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.evicted || !state.observers.is_empty() || state.gc_generation != generation {
                return;
            }
            state.gc_timer = None;
            state.evicted = true;
        }
        debug!("collecting unobserved entry");
        self.evict();
    }

    fn evict(self: &Arc<Self>) {
        if let Some(cache) = self.cache.upgrade() {
            cache.remove(self);
        }
    }

    fn is_stale_locked(state: &EntryState<A, T, K>, stale_time: Duration, now: Instant) -> bool {
        if state.is_invalidated {
            return true;
        }
        match state.data_updated_at {
            None => true,
            Some(updated_at) => updated_at
                .checked_add(stale_time)
                .is_some_and(|fresh_until| fresh_until <= now),
        }
    }

    fn settled_locked(state: &EntryState<A, T, K>) -> BoxFuture<'static, Result<T, QueryError>> {
        if let Some(invocation) = &state.last_invocation {
            if !state.in_flight.is_empty() {
                return invocation.clone().into_future().boxed();
            }
        }
        let outcome = match (&state.status, &state.error, &state.data) {
            (QueryStatus::Error, Some(error), _) => Err(error.clone()),
            (_, _, Some(data)) => Ok(data.clone()),
            _ => match &state.last_invocation {
                Some(invocation) => return invocation.clone().into_future().boxed(),
                None => Err(QueryError::InvalidOperation(
                    "query has not been fetched".to_string(),
                )),
            },
        };
        future::ready(outcome).boxed()
    }

    fn observers_of(state: &EntryState<A, T, K>) -> Vec<Arc<dyn QueryObserver<A, T, K>>> {
        state.observers.values().cloned().collect()
    }

    fn notify(
        self: &Arc<Self>,
        observers: Vec<Arc<dyn QueryObserver<A, T, K>>>,
        update: &QueryUpdate<T>,
    ) {
        for observer in observers {
            observer.on_update(self, update);
        }
    }
}

impl<A, T, K> fmt::Debug for FixedQuery<A, T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FixedQuery")
            .field("cached", &self.cached)
            .field("status", &state.status)
            .field("in_flight", &state.in_flight.len())
            .field("observers", &state.observers.len())
            .field("is_invalidated", &state.is_invalidated)
            .field("evicted", &state.evicted)
            .finish_non_exhaustive()
    }
}
