//! `ExecutionStore` trait: atomic operations over executions and step results

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::execution::{
    ExecutionPatch, ExecutionStatus, NewExecution, StepResult, StreamChunk, WorkflowExecution,
};
use crate::workflow::{Signal, WorkflowDefinition};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("step result not found: {execution_id}/{step_name}")]
    StepResultNotFound { execution_id: Uuid, step_name: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Filter + pagination for `list_executions`.
#[derive(Debug, Clone, Default)]
pub struct ListExecutionsFilter {
    pub workflow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: u32,
    pub offset: u32,
}

/// Guarded patch applied to a [`StepResult`] row; only takes effect while
/// `completed_at_epoch_ms IS NULL` at the storage layer.
#[derive(Debug, Clone, Default)]
pub struct StepResultPatch {
    pub completed_at_epoch_ms: Option<i64>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Result of `create_step_result`'s `INSERT ... ON CONFLICT DO NOTHING
/// RETURNING *` race: `created = true` means the caller won the race and
/// must execute the step.
#[derive(Debug, Clone)]
pub struct StepResultSlot {
    pub row: StepResult,
    pub created: bool,
}

/// Persists executions, step results, signals, and stream chunks; exposes
/// atomic state transitions. All mutating operations are expected to be
/// wrapped by implementations in the database retry decorator (see
/// [`crate::reliability::RetryPolicy`] and [`super::with_db_retry`]).
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError>;

    async fn create_execution(&self, new: NewExecution) -> Result<WorkflowExecution, StoreError>;

    async fn update_execution(
        &self,
        id: Uuid,
        patch: ExecutionPatch,
    ) -> Result<WorkflowExecution, StoreError>;

    /// Sets status to `cancelled` iff current status is `enqueued`/`running`.
    /// Returns `None` (no-op) otherwise.
    async fn cancel_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError>;

    /// Moves a `cancelled` execution back to `enqueued`, clearing
    /// `completed_at_epoch_ms`. Returns `None` if status was not `cancelled`.
    async fn resume_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError>;

    async fn list_executions(
        &self,
        filter: ListExecutionsFilter,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Atomically flips all `enqueued` rows whose `start_at_epoch_ms <= now`
    /// to `running` and returns their ids.
    async fn process_enqueued(&self) -> Result<Vec<Uuid>, StoreError>;

    /// `INSERT ... ON CONFLICT DO NOTHING RETURNING *`; on conflict, re-reads
    /// the existing row instead.
    async fn create_step_result(
        &self,
        execution_id: Uuid,
        step_name: &str,
    ) -> Result<StepResultSlot, StoreError>;

    /// Guarded by `completed_at_epoch_ms IS NULL`; if no row was updated
    /// (already completed), re-reads and returns the existing row.
    async fn update_step_result(
        &self,
        execution_id: Uuid,
        step_name: &str,
        patch: StepResultPatch,
    ) -> Result<StepResult, StoreError>;

    async fn get_step_result(
        &self,
        execution_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepResult>, StoreError>;

    async fn get_step_results(&self, execution_id: Uuid) -> Result<Vec<StepResult>, StoreError>;

    async fn write_stream_chunk(&self, chunk: StreamChunk) -> Result<(), StoreError>;

    /// `last_seen_by_step` maps step name to the last chunk index the caller
    /// has observed; only newer chunks are returned.
    async fn get_stream_chunks(
        &self,
        execution_id: Uuid,
        last_seen_by_step: HashMap<String, i32>,
    ) -> Result<Vec<StreamChunk>, StoreError>;

    async fn delete_stream_chunks(&self, execution_id: Uuid) -> Result<(), StoreError>;

    async fn send_signal(&self, signal: Signal) -> Result<(), StoreError>;

    /// Atomic compare-and-set on `consumed_at`: at most one caller observes
    /// `Some(signal)` for a given unconsumed row.
    async fn consume_signal(
        &self,
        execution_id: Uuid,
        name: &str,
    ) -> Result<Option<Signal>, StoreError>;

    /// `UPDATE ... WHERE lockedUntil IS NULL OR lockedUntil < now AND status
    /// IN ('enqueued','running') RETURNING lockId`. `None` means not acquired.
    async fn acquire_lock(
        &self,
        execution_id: Uuid,
        lock_id: Uuid,
        duration: std::time::Duration,
    ) -> Result<bool, StoreError>;

    /// No-op (returns `false`) unless `lock_id` matches the current holder.
    async fn release_lock(&self, execution_id: Uuid, lock_id: Uuid) -> Result<bool, StoreError>;

    /// Renews `lockedUntil`; no-op unless `lock_id` matches the current holder.
    async fn extend_lock(
        &self,
        execution_id: Uuid,
        lock_id: Uuid,
        duration: std::time::Duration,
    ) -> Result<bool, StoreError>;
}

/// Thin CRUD surface for workflow definitions. Out of scope per spec.md §1
/// ("collection CRUD tooling ... thin SQL wrappers") beyond this lookup,
/// which the executor needs to load the step graph it is running.
#[async_trait]
pub trait WorkflowRepository: Send + Sync + 'static {
    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>, StoreError>;
}
