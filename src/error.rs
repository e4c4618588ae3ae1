use thiserror::Error;
use tokio::task::JoinError;

/// Error type for query operations.
///
/// Every variant is cheap to clone so a single outcome can be handed to each
/// caller awaiting the same invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Fetch failed: {0}")]
    FetchError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    /// The fetch was cancelled before it produced an outcome.
    #[error("Query was cancelled")]
    Cancelled,

    /// The operation is not valid in the current state, e.g. refetching an
    /// observer that has never been given an argument.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The task driving the fetch panicked or was aborted.
    #[error("Fetch task failed: {0}")]
    TaskFailed(String),
}

impl QueryError {
    /// Creates a fetch error from anything displayable.
    pub fn fetch(message: impl ToString) -> Self {
        Self::FetchError(message.to_string())
    }

    /// Returns `true` if this error represents a cancellation rather than a failure.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<JoinError> for QueryError {
    fn from(err: JoinError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::TaskFailed(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_display() {
        let err = QueryError::FetchError("test error".to_string());
        assert_eq!(err.to_string(), "Fetch failed: test error");

        let err = QueryError::NetworkError("network error".to_string());
        assert_eq!(err.to_string(), "Network error: network error");

        let err = QueryError::InvalidOperation("no argument".to_string());
        assert_eq!(err.to_string(), "Invalid operation: no argument");
    }

    #[test]
    fn test_is_cancelled() {
        assert!(QueryError::Cancelled.is_cancelled());
        assert!(!QueryError::fetch("boom").is_cancelled());
    }

    #[tokio::test]
    async fn test_from_aborted_join_error() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        handle.abort();
        let err = handle.await.expect_err("aborted task should fail to join");
        assert_eq!(QueryError::from(err), QueryError::Cancelled);
    }
}
