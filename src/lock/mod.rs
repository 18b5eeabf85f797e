//! Optimistic, time-bounded row-level execution locks
//!
//! Locking lives on top of [`ExecutionStore`] rather than as a separate
//! table: the lock fields (`locked_at`, `locked_until`, `lock_id`) are part
//! of the execution row itself, so acquiring and releasing are plain guarded
//! `UPDATE`s.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::ExecutorError;
use crate::persistence::ExecutionStore;

/// Default lock duration (spec.md §4.3). Overridable per call via
/// [`EngineConfig::lock_duration`](crate::config::EngineConfig::lock_duration).
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(300);

/// Attempts to acquire the execution lock, runs `body`, and releases the
/// lock on every exit path (success, step error, or panic-free early
/// return). Failing to acquire surfaces [`ExecutorError::Locked`], which the
/// scheduler treats as retryable with a backoff of at least 30s.
#[instrument(skip(store, body))]
pub async fn with_lock<S, T, F, Fut>(
    store: &S,
    execution_id: Uuid,
    duration: Duration,
    body: F,
) -> Result<T, ExecutorError>
where
    S: ExecutionStore + ?Sized,
    F: FnOnce(Uuid) -> Fut,
    Fut: Future<Output = Result<T, ExecutorError>>,
{
    let lock_id = Uuid::now_v7();
    let acquired = store.acquire_lock(execution_id, lock_id, duration).await?;
    if !acquired {
        return Err(ExecutorError::Locked(execution_id));
    }
    debug!(%execution_id, %lock_id, "acquired execution lock");

    let result = body(lock_id).await;

    let released = store.release_lock(execution_id, lock_id).await?;
    if released {
        debug!(%execution_id, %lock_id, "released execution lock");
    }

    result
}

/// Renews `locked_until` without releasing; used by long-running step
/// executors that want to avoid losing the lock mid-phase.
pub async fn extend<S>(
    store: &S,
    execution_id: Uuid,
    lock_id: Uuid,
    duration: Duration,
) -> Result<bool, ExecutorError>
where
    S: ExecutionStore + ?Sized,
{
    Ok(store.extend_lock(execution_id, lock_id, duration).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::NewExecution;
    use crate::persistence::InMemoryExecutionStore;

    fn new_execution() -> NewExecution {
        NewExecution {
            workflow_id: "wf".to_string(),
            input: serde_json::json!({}),
            timeout_ms: None,
            start_at_epoch_ms: None,
            parent_execution_id: None,
            runtime_context: None,
            created_by: None,
        }
    }

    #[tokio::test]
    async fn with_lock_releases_on_success() {
        let store = InMemoryExecutionStore::new();
        let execution = store.create_execution(new_execution()).await.unwrap();

        let result = with_lock(&store, execution.id, DEFAULT_LOCK_DURATION, |_lock_id| async {
            Ok::<_, ExecutorError>(42)
        })
        .await
        .unwrap();
        assert_eq!(result, 42);

        // Lock was released, so a fresh acquire succeeds.
        let reacquired = with_lock(&store, execution.id, DEFAULT_LOCK_DURATION, |_lock_id| async {
            Ok::<_, ExecutorError>(())
        })
        .await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let store = InMemoryExecutionStore::new();
        let execution = store.create_execution(new_execution()).await.unwrap();

        let result: Result<(), ExecutorError> =
            with_lock(&store, execution.id, DEFAULT_LOCK_DURATION, |_lock_id| async {
                Err(ExecutorError::FatalStep("boom".into()))
            })
            .await;
        assert!(result.is_err());

        let reacquired = with_lock(&store, execution.id, DEFAULT_LOCK_DURATION, |_lock_id| async {
            Ok::<_, ExecutorError>(())
        })
        .await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn concurrent_lock_attempt_is_rejected() {
        let store = InMemoryExecutionStore::new();
        let execution = store.create_execution(new_execution()).await.unwrap();

        let held = store
            .acquire_lock(execution.id, Uuid::now_v7(), DEFAULT_LOCK_DURATION)
            .await
            .unwrap();
        assert!(held);

        let result = with_lock(&store, execution.id, DEFAULT_LOCK_DURATION, |_lock_id| async {
            Ok::<_, ExecutorError>(())
        })
        .await;
        assert!(matches!(result, Err(ExecutorError::Locked(_))));
    }
}
