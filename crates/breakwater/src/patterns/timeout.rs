//! Deadline wrapper for async operations

use std::future::Future;
use std::time::Duration;
use tokio::time::timeout as tokio_timeout;

use crate::core::error::{ExecuteError, ResilienceError, ResilienceResult};

/// Run `future` with a deadline. An elapsed deadline maps to
/// [`ResilienceError::Timeout`].
pub async fn timeout<T, F>(duration: Duration, future: F) -> ResilienceResult<T>
where
    F: Future<Output = T>,
{
    tokio_timeout(duration, future)
        .await
        .map_err(|_| ResilienceError::timeout(duration))
}

/// Deadline wrapper for fallible operations, keeping the user error on
/// its own side: a deadline maps to `Rejected(Timeout)`, the operation's
/// own failure passes through as `Inner`.
pub async fn timeout_with_error<T, E, F>(
    duration: Duration,
    future: F,
) -> Result<T, ExecuteError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio_timeout(duration, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(ExecuteError::Inner(error)),
        Err(_) => Err(ExecuteError::Rejected(ResilienceError::timeout(duration))),
    }
}
