//! Prelude module for convenient imports.
//!
//! ```
//! use querybind::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`Endpoint`] and [`MutationEndpoint`] - Fetch functions bound to a cache
//! - [`EndpointOptions`] and [`QueryOptions`] - Configuration
//! - [`Query`], [`QueryResult`], [`QueryEvent`], [`QueryStatus`] - Observers and their state
//! - [`QueryError`] - The error type
//! - [`RetryHandler`], [`NoRetry`], [`FixedRetry`], [`BackoffRetry`] - Retry strategies
//! - [`Unit`] - The absent argument or result marker

pub use crate::Unit;
pub use crate::config::{EndpointOptions, QueryOptions};
pub use crate::endpoint::{Endpoint, MutationEndpoint};
pub use crate::error::QueryError;
pub use crate::query::{Query, QueryEvent, QueryResult, QueryStatus};
pub use crate::retry::{BackoffRetry, FixedRetry, NoRetry, RetryHandler};
