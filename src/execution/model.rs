//! Execution, step-result, and stream-chunk entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Status of a [`WorkflowExecution`]. `Enqueued` and `Running` are the only
/// revivable pair; the other three are terminal and sticky, except that
/// `Cancelled` may be moved back to `Enqueued` via an explicit resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Enqueued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Enqueued => "enqueued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub parent_execution_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at_epoch_ms: Option<i64>,
    pub completed_at_epoch_ms: Option<i64>,
    pub start_at_epoch_ms: i64,
    pub deadline_at_epoch_ms: Option<i64>,

    pub locked_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub lock_id: Option<Uuid>,

    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,

    /// Opaque blob carrying caller identity/auth for later wake-ups.
    pub runtime_context: Option<Value>,
    pub created_by: Option<String>,
}

impl WorkflowExecution {
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.locked_until, Some(until) if until > now)
    }

    pub fn past_deadline(&self, now_epoch_ms: i64) -> bool {
        matches!(self.deadline_at_epoch_ms, Some(deadline) if now_epoch_ms > deadline)
    }
}

/// Input to create a new execution.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub workflow_id: String,
    pub input: Value,
    pub timeout_ms: Option<i64>,
    pub start_at_epoch_ms: Option<i64>,
    pub parent_execution_id: Option<Uuid>,
    pub runtime_context: Option<Value>,
    pub created_by: Option<String>,
}

/// Partial update applied to an execution row. `None` fields are left
/// unchanged (mirrors the store's `COALESCE`-style guarded update).
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at_epoch_ms: Option<i64>,
    pub completed_at_epoch_ms: Option<i64>,
    pub retry_count: Option<i32>,
    pub last_error: Option<String>,
}

/// The per-step checkpoint row. Key `(execution_id, step_name)` is unique;
/// once `completed_at_epoch_ms` is set the row is immutable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub execution_id: Uuid,
    pub step_name: String,
    pub started_at_epoch_ms: i64,
    pub completed_at_epoch_ms: Option<i64>,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl StepResult {
    pub fn is_completed(&self) -> bool {
        self.completed_at_epoch_ms.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.is_completed() && self.error.is_some()
    }
}

/// One chunk of incremental step output, for live observation. Ordered by
/// `(created_at, chunk_index)`; unique on `(execution_id, step_name, chunk_index)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamChunk {
    pub execution_id: Uuid,
    pub step_name: String,
    pub chunk_index: i32,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}
