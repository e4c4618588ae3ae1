//! # Querybind - cached, deduplicated, observable async queries
//!
//! Querybind wraps asynchronous fetch functions (typically HTTP calls) in a cache
//! that UI code can bind to, in the spirit of SWR or TanStack Query. It tracks
//! in-flight and completed fetches per argument, deduplicates concurrent requests
//! for the same key, decides when data is stale, reclaims entries nobody observes,
//! and resolves out-of-order completions so the most recently started fetch wins.
//!
//! ## Core Components
//!
//! - [`Endpoint`](endpoint::Endpoint): binds one fetch function to its options and cache
//! - [`Query`](query::Query): a per-consumer observer exposing derived state and events
//! - [`QueryCache`](query::QueryCache): the keyed store of entries behind an endpoint
//! - [`FixedQuery`](query::FixedQuery): the state machine for one argument key
//! - [`RetryHandler`](retry::RetryHandler): pluggable strategy wrapped around each fetch
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use querybind::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), QueryError> {
//! let endpoint = Endpoint::with_options(
//!     |n: u32, _token| async move { Ok(n.to_string()) },
//!     EndpointOptions::default().with_retry_handler(FixedRetry::new(2)),
//! );
//!
//! let query = endpoint.use_query();
//! assert_eq!(query.set_arg_async(10).await?, "10");
//! assert!(query.is_success());
//!
//! // A second observer with an infinite stale time reuses the cached value.
//! let other = endpoint.use_query_with(QueryOptions::new().with_stale_time(Duration::MAX));
//! assert_eq!(other.set_arg_async(10).await?, "10");
//! # Ok(())
//! # }
//! ```
//!
//! ## Runtime
//!
//! Fetches and garbage collection timers run as Tokio tasks, so anything that
//! starts a fetch must be called from within a Tokio runtime.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod prelude;
pub mod query;
pub mod retry;

pub use config::{EndpointOptions, QueryOptions};
pub use endpoint::{Endpoint, MutationEndpoint};
pub use error::QueryError;
pub use query::{Query, QueryEvent, QueryResult, QueryStatus};

/// Marker used where an argument or result is semantically absent.
pub type Unit = ();
