//! In-memory [`ExecutionStore`]/[`WorkflowRepository`] for tests

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::store::{
    ExecutionStore, ListExecutionsFilter, StepResultPatch, StepResultSlot, StoreError,
    WorkflowRepository,
};
use crate::execution::{
    ExecutionPatch, ExecutionStatus, NewExecution, StepResult, StreamChunk, WorkflowExecution,
};
use crate::workflow::{Signal, WorkflowDefinition};

/// Stores everything in process memory, behind short-lived `std::sync`
/// locks. Good enough for engine tests; not meant to survive a restart.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<Uuid, WorkflowExecution>>,
    step_results: RwLock<HashMap<(Uuid, String), StepResult>>,
    chunks: RwLock<HashMap<Uuid, Vec<StreamChunk>>>,
    signals: RwLock<HashMap<(Uuid, String), Signal>>,
    workflows: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a workflow definition for [`WorkflowRepository::get_workflow`].
    pub fn insert_workflow(&self, definition: WorkflowDefinition) {
        self.workflows
            .write()
            .unwrap()
            .insert(definition.id.clone(), definition);
    }

    pub fn execution_count(&self) -> usize {
        self.executions.read().unwrap().len()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self.executions.read().unwrap().get(&id).cloned())
    }

    async fn create_execution(&self, new: NewExecution) -> Result<WorkflowExecution, StoreError> {
        let now = Utc::now();
        let execution = WorkflowExecution {
            id: Uuid::now_v7(),
            workflow_id: new.workflow_id,
            status: ExecutionStatus::Enqueued,
            input: new.input,
            output: None,
            error: None,
            parent_execution_id: new.parent_execution_id,
            created_at: now,
            updated_at: now,
            started_at_epoch_ms: None,
            completed_at_epoch_ms: None,
            start_at_epoch_ms: new.start_at_epoch_ms.unwrap_or_else(|| now.timestamp_millis()),
            deadline_at_epoch_ms: new
                .timeout_ms
                .map(|timeout| now.timestamp_millis() + timeout),
            locked_at: None,
            locked_until: None,
            lock_id: None,
            retry_count: 0,
            max_retries: 0,
            last_error: None,
            runtime_context: new.runtime_context,
            created_by: new.created_by,
        };

        self.executions
            .write()
            .unwrap()
            .insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn update_execution(
        &self,
        id: Uuid,
        patch: ExecutionPatch,
    ) -> Result<WorkflowExecution, StoreError> {
        let mut executions = self.executions.write().unwrap();
        let execution = executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;

        if let Some(status) = patch.status {
            execution.status = status;
        }
        if patch.output.is_some() {
            execution.output = patch.output;
        }
        if patch.error.is_some() {
            execution.error = patch.error;
        }
        if let Some(started) = patch.started_at_epoch_ms {
            execution.started_at_epoch_ms = Some(started);
        }
        if let Some(completed) = patch.completed_at_epoch_ms {
            execution.completed_at_epoch_ms = Some(completed);
        }
        if let Some(retry_count) = patch.retry_count {
            execution.retry_count = retry_count;
        }
        if patch.last_error.is_some() {
            execution.last_error = patch.last_error;
        }
        execution.updated_at = Utc::now();
        Ok(execution.clone())
    }

    async fn cancel_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError> {
        let mut executions = self.executions.write().unwrap();
        let execution = executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;

        if !matches!(execution.status, ExecutionStatus::Enqueued | ExecutionStatus::Running) {
            return Ok(None);
        }
        execution.status = ExecutionStatus::Cancelled;
        execution.completed_at_epoch_ms = Some(Utc::now().timestamp_millis());
        execution.updated_at = Utc::now();
        Ok(Some(execution.clone()))
    }

    async fn resume_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError> {
        let mut executions = self.executions.write().unwrap();
        let execution = executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;

        if execution.status != ExecutionStatus::Cancelled {
            return Ok(None);
        }
        execution.status = ExecutionStatus::Enqueued;
        execution.completed_at_epoch_ms = None;
        execution.updated_at = Utc::now();
        Ok(Some(execution.clone()))
    }

    async fn list_executions(
        &self,
        filter: ListExecutionsFilter,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let executions = self.executions.read().unwrap();
        let mut matching: Vec<_> = executions
            .values()
            .filter(|e| {
                filter
                    .workflow_id
                    .as_ref()
                    .map_or(true, |wid| &e.workflow_id == wid)
                    && filter.status.map_or(true, |status| e.status == status)
            })
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let offset = filter.offset as usize;
        let limit = if filter.limit == 0 {
            matching.len()
        } else {
            filter.limit as usize
        };
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn process_enqueued(&self) -> Result<Vec<Uuid>, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut executions = self.executions.write().unwrap();
        let mut flipped = Vec::new();
        for execution in executions.values_mut() {
            if execution.status == ExecutionStatus::Enqueued && execution.start_at_epoch_ms <= now_ms
            {
                execution.status = ExecutionStatus::Running;
                execution.started_at_epoch_ms.get_or_insert(now_ms);
                execution.updated_at = Utc::now();
                flipped.push(execution.id);
            }
        }
        Ok(flipped)
    }

    async fn create_step_result(
        &self,
        execution_id: Uuid,
        step_name: &str,
    ) -> Result<StepResultSlot, StoreError> {
        let mut results = self.step_results.write().unwrap();
        let key = (execution_id, step_name.to_string());
        if let Some(existing) = results.get(&key) {
            return Ok(StepResultSlot {
                row: existing.clone(),
                created: false,
            });
        }

        let row = StepResult {
            execution_id,
            step_name: step_name.to_string(),
            started_at_epoch_ms: Utc::now().timestamp_millis(),
            completed_at_epoch_ms: None,
            output: None,
            error: None,
        };
        results.insert(key, row.clone());
        Ok(StepResultSlot { row, created: true })
    }

    async fn update_step_result(
        &self,
        execution_id: Uuid,
        step_name: &str,
        patch: StepResultPatch,
    ) -> Result<StepResult, StoreError> {
        let mut results = self.step_results.write().unwrap();
        let key = (execution_id, step_name.to_string());
        let row = results
            .get_mut(&key)
            .ok_or_else(|| StoreError::StepResultNotFound {
                execution_id,
                step_name: step_name.to_string(),
            })?;

        if row.completed_at_epoch_ms.is_none() {
            row.completed_at_epoch_ms = patch.completed_at_epoch_ms;
            row.output = patch.output;
            row.error = patch.error;
        }
        Ok(row.clone())
    }

    async fn get_step_result(
        &self,
        execution_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepResult>, StoreError> {
        Ok(self
            .step_results
            .read()
            .unwrap()
            .get(&(execution_id, step_name.to_string()))
            .cloned())
    }

    async fn get_step_results(&self, execution_id: Uuid) -> Result<Vec<StepResult>, StoreError> {
        Ok(self
            .step_results
            .read()
            .unwrap()
            .values()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn write_stream_chunk(&self, chunk: StreamChunk) -> Result<(), StoreError> {
        self.chunks
            .write()
            .unwrap()
            .entry(chunk.execution_id)
            .or_default()
            .push(chunk);
        Ok(())
    }

    async fn get_stream_chunks(
        &self,
        execution_id: Uuid,
        last_seen_by_step: HashMap<String, i32>,
    ) -> Result<Vec<StreamChunk>, StoreError> {
        let chunks = self.chunks.read().unwrap();
        let Some(all) = chunks.get(&execution_id) else {
            return Ok(vec![]);
        };

        Ok(all
            .iter()
            .filter(|c| {
                let last_seen = last_seen_by_step.get(&c.step_name).copied().unwrap_or(-1);
                c.chunk_index > last_seen
            })
            .cloned()
            .collect())
    }

    async fn delete_stream_chunks(&self, execution_id: Uuid) -> Result<(), StoreError> {
        self.chunks.write().unwrap().remove(&execution_id);
        Ok(())
    }

    async fn send_signal(&self, signal: Signal) -> Result<(), StoreError> {
        self.signals
            .write()
            .unwrap()
            .insert((signal.execution_id, signal.name.clone()), signal);
        Ok(())
    }

    async fn consume_signal(
        &self,
        execution_id: Uuid,
        name: &str,
    ) -> Result<Option<Signal>, StoreError> {
        let mut signals = self.signals.write().unwrap();
        let Some(signal) = signals.get_mut(&(execution_id, name.to_string())) else {
            return Ok(None);
        };
        if signal.is_consumed() {
            return Ok(None);
        }
        signal.consumed_at = Some(Utc::now());
        Ok(Some(signal.clone()))
    }

    async fn acquire_lock(
        &self,
        execution_id: Uuid,
        lock_id: Uuid,
        duration: std::time::Duration,
    ) -> Result<bool, StoreError> {
        let mut executions = self.executions.write().unwrap();
        let execution = executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        let now = Utc::now();
        if !matches!(execution.status, ExecutionStatus::Enqueued | ExecutionStatus::Running) {
            return Ok(false);
        }
        if execution.is_locked(now) {
            return Ok(false);
        }

        execution.locked_at = Some(now);
        execution.locked_until = Some(now + chrono::Duration::from_std(duration).unwrap_or_default());
        execution.lock_id = Some(lock_id);
        Ok(true)
    }

    async fn release_lock(&self, execution_id: Uuid, lock_id: Uuid) -> Result<bool, StoreError> {
        let mut executions = self.executions.write().unwrap();
        let execution = executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        if execution.lock_id != Some(lock_id) {
            return Ok(false);
        }
        execution.locked_at = None;
        execution.locked_until = None;
        execution.lock_id = None;
        Ok(true)
    }

    async fn extend_lock(
        &self,
        execution_id: Uuid,
        lock_id: Uuid,
        duration: std::time::Duration,
    ) -> Result<bool, StoreError> {
        let mut executions = self.executions.write().unwrap();
        let execution = executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        if execution.lock_id != Some(lock_id) {
            return Ok(false);
        }
        execution.locked_until =
            Some(Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default());
        Ok(true)
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryExecutionStore {
    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.workflows.read().unwrap().get(id).cloned())
    }
}
