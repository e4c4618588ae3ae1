//! Side-effecting endpoints whose calls are never cached or shared.

use std::future::Future;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::Unit;
use crate::config::EndpointOptions;
use crate::error::QueryError;
use crate::query::{Query, QueryValue};

use super::Endpoint;

/// An endpoint for mutations: calls taking `A` that produce no result.
///
/// Every call goes through [`Query::mutate`], which runs the fetch on a fresh
/// uncached entry, so two mutations with equal arguments both execute.
///
/// All arguments map to the single key `()`. Two consequences follow:
///
/// - `set_arg` on a mutation observer shares one cached entry across every
///   argument. Use `mutate` instead.
/// - `update_query_data` reaches every live mutation entry, whatever its argument.
///
/// # Example
///
/// ```rust
/// use querybind::{Endpoint, EndpointOptions, MutationEndpoint, QueryError};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), QueryError> {
/// let delete_user: MutationEndpoint<u32> = Endpoint::mutation(
///     |_id: u32, _token| async { Ok(()) },
///     EndpointOptions::default(),
/// );
///
/// let mutation = delete_user.use_query();
/// mutation.mutate_async(7).await?;
/// assert!(mutation.is_success());
/// # Ok(())
/// # }
/// ```
pub type MutationEndpoint<A> = Endpoint<A, Unit, Unit>;

impl<A> Endpoint<A, Unit, Unit>
where
    A: QueryValue,
{
    /// Creates a mutation endpoint. The argument does not need to be hashable.
    pub fn mutation<F, Fut>(fetch: F, options: EndpointOptions<A, Unit>) -> Self
    where
        F: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Unit, QueryError>> + Send + 'static,
    {
        Self::with_key_selector(fetch, options, |_: &A| ())
    }
}

impl<A> Query<A, Unit, Unit>
where
    A: QueryValue,
{
    /// Runs the mutation without waiting for it.
    pub fn mutate(&self, arg: A) {
        self.trigger(arg);
    }

    /// Runs the mutation and resolves once it completes.
    pub fn mutate_async(&self, arg: A) -> BoxFuture<'static, Result<Unit, QueryError>> {
        self.trigger_async(arg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryStatus;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct Rename {
        id: u32,
        name: String,
    }

    #[tokio::test]
    async fn test_every_mutation_executes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let endpoint = Endpoint::mutation(
            move |rename: Rename, _token| {
                sink.lock().push(rename);
                async { Ok(()) }
            },
            EndpointOptions::default(),
        );

        let mutation = endpoint.use_query();
        let rename = Rename {
            id: 1,
            name: "ada".to_string(),
        };
        mutation.mutate_async(rename.clone()).await.expect("first");
        mutation.mutate_async(rename.clone()).await.expect("second");

        assert_eq!(*log.lock(), vec![rename.clone(), rename]);
        assert!(endpoint.cache().is_empty());
        assert_eq!(endpoint.cache().uncached_len(), 1);
    }

    #[tokio::test]
    async fn test_failed_mutation_reports_error() {
        let endpoint: MutationEndpoint<u32> = Endpoint::mutation(
            |id: u32, _token| async move { Err(QueryError::fetch(format!("cannot delete {id}"))) },
            EndpointOptions::default(),
        );

        let mutation = endpoint.use_query();
        let result = mutation.mutate_async(3).await;

        assert_eq!(result, Err(QueryError::fetch("cannot delete 3")));
        assert_eq!(mutation.status(), QueryStatus::Error);
        assert_eq!(mutation.arg(), Some(3));
    }

    #[tokio::test]
    async fn test_all_arguments_share_the_unit_key() {
        let endpoint: MutationEndpoint<u32> =
            Endpoint::mutation(|_id: u32, _token| async { Ok(()) }, EndpointOptions::default());

        let first = endpoint.use_query();
        let second = endpoint.use_query();
        first.set_arg_async(1).await.expect("first");
        second.set_arg_async(2).await.expect("second");
        assert_eq!(endpoint.cache().len(), 1);
        assert!(Arc::ptr_eq(
            &first.current().expect("attached"),
            &second.current().expect("attached"),
        ));

        let third = endpoint.use_query();
        let fourth = endpoint.use_query();
        third.mutate_async(3).await.expect("third");
        fourth.mutate_async(4).await.expect("fourth");
        assert_eq!(endpoint.cache().uncached_len(), 2);
        assert_eq!(endpoint.cache().get_all_queries(&3).len(), 3);
    }

    #[tokio::test]
    async fn test_detach_removes_uncached_entry() {
        let endpoint: MutationEndpoint<u32> =
            Endpoint::mutation(|_id: u32, _token| async { Ok(()) }, EndpointOptions::default());

        let mutation = endpoint.use_query();
        mutation.mutate_async(1).await.expect("mutation");
        assert_eq!(endpoint.cache().uncached_len(), 1);

        mutation.detach();
        assert_eq!(endpoint.cache().uncached_len(), 0);
    }
}
