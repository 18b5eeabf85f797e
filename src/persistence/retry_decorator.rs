//! Database-retry decorator: wraps a fallible store call with the engine's
//! exponential backoff (spec.md §4.2).

use std::future::Future;

use tracing::warn;

use super::store::StoreError;
use crate::reliability::RetryPolicy;

/// Retries `op` according to `policy` while it keeps returning
/// [`StoreError::Database`]; any other error variant is returned immediately,
/// since it is not a transient connection/contention failure.
pub async fn with_db_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(StoreError::Database(message)) if policy.has_attempts_remaining(attempt) => {
                let delay = policy.delay_for_attempt(attempt + 1);
                warn!(attempt, ?delay, %message, "retrying database operation");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(other) => return Err(other),
        }
    }
}
