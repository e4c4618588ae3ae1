use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::QueryError;
use crate::retry::RetryHandler;

/// Callback fired with the argument and value of a successful fetch.
pub type SuccessHook<A, T> = Arc<dyn Fn(&A, &T) + Send + Sync>;

/// Callback fired with the argument and error of a failed fetch.
pub type FailureHook<A> = Arc<dyn Fn(&A, &QueryError) + Send + Sync>;

/// Configuration shared by every query an endpoint produces.
///
/// This controls how long unobserved entries are kept, when data is considered
/// stale, how failed fetches are retried, and which endpoint-wide hooks fire.
pub struct EndpointOptions<A, T> {
    /// How long an entry with no observers is retained before being garbage collected.
    ///
    /// `Duration::ZERO` removes the entry as soon as its last observer detaches,
    /// `Duration::MAX` keeps it for the lifetime of the endpoint.
    pub cache_time: Duration,

    /// How long data is considered fresh before becoming stale.
    ///
    /// Observers attaching to fresh data reuse it without refetching. Stale data
    /// is refetched when an observer attaches. `Duration::MAX` means data only
    /// becomes stale through explicit invalidation.
    pub default_stale_time: Duration,

    /// Strategy wrapped around every fetch. `None` invokes the fetch directly.
    pub retry_handler: Option<Arc<dyn RetryHandler<T>>>,

    /// Fired on every successful fetch, whether or not anything observes the entry.
    pub on_success: Option<SuccessHook<A, T>>,

    /// Fired on every failed fetch, whether or not anything observes the entry.
    pub on_failure: Option<FailureHook<A>>,
}

impl<A, T> Default for EndpointOptions<A, T> {
    fn default() -> Self {
        Self {
            cache_time: Duration::from_secs(5 * 60), // 5 minutes
            default_stale_time: Duration::from_secs(0), // immediately stale
            retry_handler: None,
            on_success: None,
            on_failure: None,
        }
    }
}

impl<A, T> EndpointOptions<A, T> {
    /// Creates endpoint options with the given cache and stale times.
    #[must_use]
    pub const fn new(cache_time: Duration, default_stale_time: Duration) -> Self {
        Self {
            cache_time,
            default_stale_time,
            retry_handler: None,
            on_success: None,
            on_failure: None,
        }
    }

    #[must_use]
    pub const fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    #[must_use]
    pub const fn with_default_stale_time(mut self, stale_time: Duration) -> Self {
        self.default_stale_time = stale_time;
        self
    }

    #[must_use]
    pub fn with_retry_handler(mut self, handler: impl RetryHandler<T> + 'static) -> Self {
        self.retry_handler = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn with_on_success(mut self, hook: impl Fn(&A, &T) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn with_on_failure(
        mut self,
        hook: impl Fn(&A, &QueryError) + Send + Sync + 'static,
    ) -> Self {
        self.on_failure = Some(Arc::new(hook));
        self
    }
}

impl<A, T> Clone for EndpointOptions<A, T> {
    fn clone(&self) -> Self {
        Self {
            cache_time: self.cache_time,
            default_stale_time: self.default_stale_time,
            retry_handler: self.retry_handler.clone(),
            on_success: self.on_success.clone(),
            on_failure: self.on_failure.clone(),
        }
    }
}

impl<A, T> fmt::Debug for EndpointOptions<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointOptions")
            .field("cache_time", &self.cache_time)
            .field("default_stale_time", &self.default_stale_time)
            .field("retry_handler", &self.retry_handler.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

/// Per-observer configuration passed to [`Endpoint::use_query_with`](crate::Endpoint::use_query_with).
pub struct QueryOptions<A, T> {
    /// Overrides the endpoint's default stale time for this observer only.
    pub stale_time: Option<Duration>,

    /// Fired when a fetch of the attached entry succeeds.
    pub on_success: Option<SuccessHook<A, T>>,

    /// Fired when a fetch of the attached entry fails.
    pub on_failure: Option<FailureHook<A>>,
}

impl<A, T> Default for QueryOptions<A, T> {
    fn default() -> Self {
        Self {
            stale_time: None,
            on_success: None,
            on_failure: None,
        }
    }
}

impl<A, T> QueryOptions<A, T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    #[must_use]
    pub fn with_on_success(mut self, hook: impl Fn(&A, &T) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn with_on_failure(
        mut self,
        hook: impl Fn(&A, &QueryError) + Send + Sync + 'static,
    ) -> Self {
        self.on_failure = Some(Arc::new(hook));
        self
    }
}

impl<A, T> Clone for QueryOptions<A, T> {
    fn clone(&self) -> Self {
        Self {
            stale_time: self.stale_time,
            on_success: self.on_success.clone(),
            on_failure: self.on_failure.clone(),
        }
    }
}

impl<A, T> fmt::Debug for QueryOptions<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("stale_time", &self.stale_time)
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}
