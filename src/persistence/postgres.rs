//! PostgreSQL-backed [`ExecutionStore`]/[`WorkflowRepository`]
//!
//! Atomicity relies on three SQL idioms rather than application-level locks:
//! - `INSERT ... ON CONFLICT DO NOTHING RETURNING *` for step-result creation
//! - guarded `UPDATE ... WHERE completed_at_epoch_ms IS NULL` for step completion
//! - guarded `UPDATE ... WHERE consumed_at IS NULL RETURNING *` for signal consumption

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::retry_decorator::with_db_retry;
use super::store::{
    ExecutionStore, ListExecutionsFilter, StepResultPatch, StepResultSlot, StoreError,
    WorkflowRepository,
};
use crate::execution::{
    ExecutionPatch, ExecutionStatus, NewExecution, StepResult, StreamChunk, WorkflowExecution,
};
use crate::reliability::RetryPolicy;
use crate::workflow::{Signal, WorkflowDefinition};

/// Connection-pooled store. Cloning is cheap; the pool is reference counted.
/// Every mutating operation is wrapped in the database-retry decorator
/// (spec.md §4.2), so a transient connection drop or contention error is
/// absorbed here rather than bubbling up as a permanent execution failure.
#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
    retry_policy: RetryPolicy,
}

impl PostgresExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_retry_policy(pool, RetryPolicy::exponential())
    }

    pub fn with_retry_policy(pool: PgPool, retry_policy: RetryPolicy) -> Self {
        Self { pool, retry_policy }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_status(status: &str) -> Result<ExecutionStatus, StoreError> {
    match status {
        "enqueued" => Ok(ExecutionStatus::Enqueued),
        "running" => Ok(ExecutionStatus::Running),
        "completed" => Ok(ExecutionStatus::Completed),
        "failed" => Ok(ExecutionStatus::Failed),
        "cancelled" => Ok(ExecutionStatus::Cancelled),
        other => Err(StoreError::Database(format!("unknown execution status: {other}"))),
    }
}

fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<WorkflowExecution, StoreError> {
    let status: String = row.get("status");
    Ok(WorkflowExecution {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        status: parse_status(&status)?,
        input: row.get("input"),
        output: row.get("output"),
        error: row.get("error"),
        parent_execution_id: row.get("parent_execution_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        started_at_epoch_ms: row.get("started_at_epoch_ms"),
        completed_at_epoch_ms: row.get("completed_at_epoch_ms"),
        start_at_epoch_ms: row.get("start_at_epoch_ms"),
        deadline_at_epoch_ms: row.get("deadline_at_epoch_ms"),
        locked_at: row.get("locked_at"),
        locked_until: row.get("locked_until"),
        lock_id: row.get("lock_id"),
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        last_error: row.get("last_error"),
        runtime_context: row.get("runtime_context"),
        created_by: row.get("created_by"),
    })
}

fn row_to_step_result(row: &sqlx::postgres::PgRow) -> StepResult {
    StepResult {
        execution_id: row.get("execution_id"),
        step_name: row.get("step_name"),
        started_at_epoch_ms: row.get("started_at_epoch_ms"),
        completed_at_epoch_ms: row.get("completed_at_epoch_ms"),
        output: row.get("output"),
        error: row.get("error"),
    }
}

fn row_to_signal(row: &sqlx::postgres::PgRow) -> Signal {
    Signal {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        name: row.get("name"),
        payload: row.get("payload"),
        created_at: row.get("created_at"),
        consumed_at: row.get("consumed_at"),
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    #[instrument(skip(self))]
    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        row.as_ref().map(row_to_execution).transpose()
    }

    #[instrument(skip(self, new))]
    async fn create_execution(&self, new: NewExecution) -> Result<WorkflowExecution, StoreError> {
        let execution = with_db_retry(&self.retry_policy, || async {
            let now = Utc::now();
            let start_at_epoch_ms = new.start_at_epoch_ms.unwrap_or_else(|| now.timestamp_millis());
            let deadline_at_epoch_ms = new.timeout_ms.map(|timeout| now.timestamp_millis() + timeout);

            let row = sqlx::query(
                r#"
                INSERT INTO executions (
                    id, workflow_id, status, input, parent_execution_id,
                    created_at, updated_at, start_at_epoch_ms, deadline_at_epoch_ms,
                    retry_count, max_retries, runtime_context, created_by
                )
                VALUES ($1, $2, 'enqueued', $3, $4, $5, $5, $6, $7, 0, 0, $8, $9)
                RETURNING *
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(&new.workflow_id)
            .bind(&new.input)
            .bind(new.parent_execution_id)
            .bind(now)
            .bind(start_at_epoch_ms)
            .bind(deadline_at_epoch_ms)
            .bind(&new.runtime_context)
            .bind(&new.created_by)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("failed to create execution: {e}");
                StoreError::Database(e.to_string())
            })?;

            row_to_execution(&row)
        })
        .await?;

        debug!(execution_id = %execution.id, workflow_id = %execution.workflow_id, "created execution");
        Ok(execution)
    }

    #[instrument(skip(self, patch))]
    async fn update_execution(
        &self,
        id: Uuid,
        patch: ExecutionPatch,
    ) -> Result<WorkflowExecution, StoreError> {
        with_db_retry(&self.retry_policy, || async {
            let status_str = patch.status.map(|s| s.to_string());
            let row = sqlx::query(
                r#"
                UPDATE executions
                SET status = COALESCE($2, status),
                    output = COALESCE($3, output),
                    error = COALESCE($4, error),
                    started_at_epoch_ms = COALESCE($5, started_at_epoch_ms),
                    completed_at_epoch_ms = COALESCE($6, completed_at_epoch_ms),
                    retry_count = COALESCE($7, retry_count),
                    last_error = COALESCE($8, last_error),
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(&status_str)
            .bind(&patch.output)
            .bind(&patch.error)
            .bind(patch.started_at_epoch_ms)
            .bind(patch.completed_at_epoch_ms)
            .bind(patch.retry_count)
            .bind(&patch.last_error)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::ExecutionNotFound(id))?;

            row_to_execution(&row)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn cancel_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError> {
        with_db_retry(&self.retry_policy, || async {
            let row = sqlx::query(
                r#"
                UPDATE executions
                SET status = 'cancelled', completed_at_epoch_ms = $2, updated_at = NOW()
                WHERE id = $1 AND status IN ('enqueued', 'running')
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(Utc::now().timestamp_millis())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            row.as_ref().map(row_to_execution).transpose()
        })
        .await
    }

    #[instrument(skip(self))]
    async fn resume_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError> {
        with_db_retry(&self.retry_policy, || async {
            let row = sqlx::query(
                r#"
                UPDATE executions
                SET status = 'enqueued', completed_at_epoch_ms = NULL, updated_at = NOW()
                WHERE id = $1 AND status = 'cancelled'
                RETURNING *
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            row.as_ref().map(row_to_execution).transpose()
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_executions(
        &self,
        filter: ListExecutionsFilter,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let status_str = filter.status.map(|s| s.to_string());
        let limit = if filter.limit == 0 { 50 } else { filter.limit };

        let rows = sqlx::query(
            r#"
            SELECT * FROM executions
            WHERE ($1::text IS NULL OR workflow_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            OFFSET $3
            LIMIT $4
            "#,
        )
        .bind(&filter.workflow_id)
        .bind(&status_str)
        .bind(filter.offset as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_execution).collect()
    }

    #[instrument(skip(self))]
    async fn process_enqueued(&self) -> Result<Vec<Uuid>, StoreError> {
        with_db_retry(&self.retry_policy, || async {
            let now_ms = Utc::now().timestamp_millis();
            let rows = sqlx::query(
                r#"
                UPDATE executions
                SET status = 'running',
                    started_at_epoch_ms = COALESCE(started_at_epoch_ms, $1),
                    updated_at = NOW()
                WHERE id IN (
                    SELECT id FROM executions
                    WHERE status = 'enqueued' AND start_at_epoch_ms <= $1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id
                "#,
            )
            .bind(now_ms)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("failed to process enqueued executions: {e}");
                StoreError::Database(e.to_string())
            })?;

            Ok(rows.iter().map(|r| r.get("id")).collect())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn create_step_result(
        &self,
        execution_id: Uuid,
        step_name: &str,
    ) -> Result<StepResultSlot, StoreError> {
        with_db_retry(&self.retry_policy, || async {
            let inserted = sqlx::query(
                r#"
                INSERT INTO step_results (execution_id, step_name, started_at_epoch_ms)
                VALUES ($1, $2, $3)
                ON CONFLICT (execution_id, step_name) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(execution_id)
            .bind(step_name)
            .bind(Utc::now().timestamp_millis())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            if let Some(row) = inserted {
                return Ok(StepResultSlot {
                    row: row_to_step_result(&row),
                    created: true,
                });
            }

            let row = sqlx::query("SELECT * FROM step_results WHERE execution_id = $1 AND step_name = $2")
                .bind(execution_id)
                .bind(step_name)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;

            Ok(StepResultSlot {
                row: row_to_step_result(&row),
                created: false,
            })
        })
        .await
    }

    #[instrument(skip(self, patch))]
    async fn update_step_result(
        &self,
        execution_id: Uuid,
        step_name: &str,
        patch: StepResultPatch,
    ) -> Result<StepResult, StoreError> {
        with_db_retry(&self.retry_policy, || async {
            let updated = sqlx::query(
                r#"
                UPDATE step_results
                SET completed_at_epoch_ms = $3, output = $4, error = $5
                WHERE execution_id = $1 AND step_name = $2 AND completed_at_epoch_ms IS NULL
                RETURNING *
                "#,
            )
            .bind(execution_id)
            .bind(step_name)
            .bind(patch.completed_at_epoch_ms)
            .bind(&patch.output)
            .bind(&patch.error)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            if let Some(row) = updated {
                return Ok(row_to_step_result(&row));
            }

            let row = sqlx::query("SELECT * FROM step_results WHERE execution_id = $1 AND step_name = $2")
                .bind(execution_id)
                .bind(step_name)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?
                .ok_or_else(|| StoreError::StepResultNotFound {
                    execution_id,
                    step_name: step_name.to_string(),
                })?;

            Ok(row_to_step_result(&row))
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_step_result(
        &self,
        execution_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepResult>, StoreError> {
        let row = sqlx::query("SELECT * FROM step_results WHERE execution_id = $1 AND step_name = $2")
            .bind(execution_id)
            .bind(step_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.as_ref().map(row_to_step_result))
    }

    #[instrument(skip(self))]
    async fn get_step_results(&self, execution_id: Uuid) -> Result<Vec<StepResult>, StoreError> {
        let rows = sqlx::query("SELECT * FROM step_results WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows.iter().map(row_to_step_result).collect())
    }

    #[instrument(skip(self, chunk))]
    async fn write_stream_chunk(&self, chunk: StreamChunk) -> Result<(), StoreError> {
        with_db_retry(&self.retry_policy, || async {
            sqlx::query(
                r#"
                INSERT INTO stream_chunks (execution_id, step_name, chunk_index, data, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (execution_id, step_name, chunk_index) DO NOTHING
                "#,
            )
            .bind(chunk.execution_id)
            .bind(&chunk.step_name)
            .bind(chunk.chunk_index)
            .bind(&chunk.data)
            .bind(chunk.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, last_seen_by_step))]
    async fn get_stream_chunks(
        &self,
        execution_id: Uuid,
        last_seen_by_step: HashMap<String, i32>,
    ) -> Result<Vec<StreamChunk>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, step_name, chunk_index, data, created_at
            FROM stream_chunks
            WHERE execution_id = $1
            ORDER BY created_at, chunk_index
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| StreamChunk {
                execution_id: row.get("execution_id"),
                step_name: row.get("step_name"),
                chunk_index: row.get("chunk_index"),
                data: row.get("data"),
                created_at: row.get("created_at"),
            })
            .filter(|c: &StreamChunk| {
                let last_seen = last_seen_by_step.get(&c.step_name).copied().unwrap_or(-1);
                c.chunk_index > last_seen
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn delete_stream_chunks(&self, execution_id: Uuid) -> Result<(), StoreError> {
        with_db_retry(&self.retry_policy, || async {
            sqlx::query("DELETE FROM stream_chunks WHERE execution_id = $1")
                .bind(execution_id)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, signal))]
    async fn send_signal(&self, signal: Signal) -> Result<(), StoreError> {
        with_db_retry(&self.retry_policy, || async {
            sqlx::query(
                r#"
                INSERT INTO signals (id, execution_id, name, payload, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(signal.id)
            .bind(signal.execution_id)
            .bind(&signal.name)
            .bind(&signal.payload)
            .bind(signal.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn consume_signal(
        &self,
        execution_id: Uuid,
        name: &str,
    ) -> Result<Option<Signal>, StoreError> {
        with_db_retry(&self.retry_policy, || async {
            let row = sqlx::query(
                r#"
                UPDATE signals
                SET consumed_at = NOW()
                WHERE id = (
                    SELECT id FROM signals
                    WHERE execution_id = $1 AND name = $2 AND consumed_at IS NULL
                    ORDER BY created_at
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING *
                "#,
            )
            .bind(execution_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            Ok(row.as_ref().map(row_to_signal))
        })
        .await
    }

    #[instrument(skip(self))]
    async fn acquire_lock(
        &self,
        execution_id: Uuid,
        lock_id: Uuid,
        duration: std::time::Duration,
    ) -> Result<bool, StoreError> {
        with_db_retry(&self.retry_policy, || async {
            let now = Utc::now();
            let until = now + chrono::Duration::from_std(duration).unwrap_or_default();

            let row = sqlx::query(
                r#"
                UPDATE executions
                SET locked_at = $2, locked_until = $3, lock_id = $4
                WHERE id = $1
                  AND (locked_until IS NULL OR locked_until < $2)
                  AND status IN ('enqueued', 'running')
                RETURNING id
                "#,
            )
            .bind(execution_id)
            .bind(now)
            .bind(until)
            .bind(lock_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            Ok(row.is_some())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn release_lock(&self, execution_id: Uuid, lock_id: Uuid) -> Result<bool, StoreError> {
        with_db_retry(&self.retry_policy, || async {
            let row = sqlx::query(
                r#"
                UPDATE executions
                SET locked_at = NULL, locked_until = NULL, lock_id = NULL
                WHERE id = $1 AND lock_id = $2
                RETURNING id
                "#,
            )
            .bind(execution_id)
            .bind(lock_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            Ok(row.is_some())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn extend_lock(
        &self,
        execution_id: Uuid,
        lock_id: Uuid,
        duration: std::time::Duration,
    ) -> Result<bool, StoreError> {
        with_db_retry(&self.retry_policy, || async {
            let until = Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default();
            let row = sqlx::query(
                r#"
                UPDATE executions
                SET locked_until = $3
                WHERE id = $1 AND lock_id = $2
                RETURNING id
                "#,
            )
            .bind(execution_id)
            .bind(lock_id)
            .bind(until)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            Ok(row.is_some())
        })
        .await
    }
}

#[async_trait]
impl WorkflowRepository for PostgresExecutionStore {
    #[instrument(skip(self))]
    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        row.map(|row| {
            let definition: serde_json::Value = row.get("definition");
            serde_json::from_value(definition).map_err(|e| StoreError::Serialization(e.to_string()))
        })
        .transpose()
    }
}

// Exercised against a real database by tests/postgres_integration.rs, gated
// behind #[ignore] (cargo test --test postgres_integration -- --ignored).
