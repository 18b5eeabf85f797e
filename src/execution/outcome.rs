//! Durable control flow as data, not exceptions
//!
//! Per the redesign notes, `DurableSleep` and `WaitingForSignal` stop being
//! thrown errors and become ordinary variants of a result sum type. Only
//! genuine failures travel through `Result::Err`.

use serde_json::Value;
use std::time::Duration;

/// Outcome of dispatching a single step through the [`crate::step`] executor.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed(Value),
    Failed { message: String, retryable: bool },
    Sleeping { wake_at_epoch_ms: i64 },
    WaitingForSignal {
        signal_name: String,
        timeout_at_epoch_ms: Option<i64>,
    },
}

/// Outcome of one delivery of the top-level [`crate::engine::WorkflowExecutor`].
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Completed { output: Value },
    Failed { error: String },
    Sleeping { wake_at_epoch_ms: i64 },
    WaitingForSignal {
        signal_name: String,
        step_name: String,
        timeout_at_epoch_ms: Option<i64>,
    },
    Cancelled,
    /// Transient failure; the scheduler should re-enter after `delay`.
    NeedsRetry { delay: Duration, retry_count: i32 },
}

impl ExecutionOutcome {
    pub fn status_label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Sleeping { .. } => "sleeping",
            Self::WaitingForSignal { .. } => "waiting_for_signal",
            Self::Cancelled => "cancelled",
            Self::NeedsRetry { .. } => "needs_retry",
        }
    }
}
