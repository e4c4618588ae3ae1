//! Query cache entries, the keyed cache that owns them, and the observers that bind to them.
//!
//! This module holds the state machine behind every [`Endpoint`](crate::Endpoint):
//!
//! - [`FixedQuery`]: the authoritative state for one argument key. It runs fetches,
//!   applies only the most recently started one, and reclaims itself once unobserved.
//! - [`QueryCache`]: the keyed store of entries for one endpoint, plus the unshared
//!   entries created by `trigger` calls.
//! - [`Query`]: a per-consumer handle that attaches to one entry at a time and
//!   exposes derived state and change events.
//!
//! # Design Pattern: Explicit Observer Sets
//!
//! Entries keep an explicit set of attached observers. Attaching disarms the
//! entry's garbage collection timer and detaching the last observer arms it, so a
//! consumer that forgets to detach keeps its entry alive. Dropping a [`Query`]
//! detaches it.

mod cache;
mod fixed;
mod observer;

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub use cache::{KeySelector, QueryCache};
pub use fixed::{FetchFn, FixedQuery, Invocation};
pub use observer::{Query, QueryEvent, QueryResult};

pub(crate) use fixed::QuerySettings;

use crate::error::QueryError;

/// Values that can be used as query arguments or results.
pub trait QueryValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> QueryValue for T {}

/// Values that can identify a cache entry.
pub trait QueryKey: QueryValue + Eq + Hash {}

impl<T: QueryValue + Eq + Hash> QueryKey for T {}

/// Lifecycle status of a cache entry.
///
/// `Loading` is only used for the first load. A refetch of an entry that already
/// succeeded keeps it at `Success`; use `is_fetching` to detect background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryStatus {
    #[default]
    Idle,
    Loading,
    Error,
    Success,
}

/// Identity of an observer within an entry's observer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl ObserverId {
    /// Allocates a process-unique id.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Change delivered by a [`FixedQuery`] to its observers.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryUpdate<T> {
    /// A fetch started.
    Started,
    /// The most recent fetch succeeded and its value was applied.
    Succeeded(T),
    /// The most recent fetch failed and its error was applied.
    Failed(QueryError),
    /// A fetch finished but a newer one had already been applied.
    Superseded,
    /// A fetch was cancelled.
    Cancelled,
    /// The data was replaced directly without a fetch.
    DataUpdated,
}

/// Receives updates from the entries it is attached to.
///
/// Entries never hold their own lock while calling an observer.
pub trait QueryObserver<A, T, K>: Send + Sync {
    fn on_update(&self, query: &Arc<FixedQuery<A, T, K>>, update: &QueryUpdate<T>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observer_ids_are_unique() {
        let first = ObserverId::next();
        let second = ObserverId::next();
        assert_ne!(first, second);
    }

    #[test]
    fn test_default_status_is_idle() {
        assert_eq!(QueryStatus::default(), QueryStatus::Idle);
    }
}
